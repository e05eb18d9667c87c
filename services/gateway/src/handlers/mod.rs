pub mod control;
pub mod status;
pub mod subscriptions;
pub mod ws;
