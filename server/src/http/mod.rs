pub mod results_client;
