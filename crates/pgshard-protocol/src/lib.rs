pub mod backend;
pub mod frontend;
pub mod messages;
pub mod wire;

pub use messages::BackendMessage;
pub use messages::ErrorFields;
pub use messages::FrontendMessage;
pub use messages::TransactionState;

#[cfg(test)]
mod tests;
