pub mod messages;
pub mod session;
pub mod subscriptions;
