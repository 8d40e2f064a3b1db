// sol-test-utils: In-process peers for integration tests.
//
// MockSolServer plays the remote aggregation server: it records every
// publish payload and answers with scripted status codes.

pub mod mock_sol_server;

pub use mock_sol_server::MockSolServer;
