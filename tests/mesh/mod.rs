mod discovery_tests;
mod http_client_tests;
mod probe_engine_tests;
mod routing_tests;
mod scheduler_tests;
