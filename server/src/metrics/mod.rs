pub mod tracker_metrics;
