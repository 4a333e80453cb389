use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Invalid message name: {0}")]
    InvalidMsgName(String),

    #[error("Message block too short: got {0} bytes")]
    ShortMessageBlock(usize),

    #[error("Unknown protocol code: {0}")]
    UnknownProtocol(u8),

    #[error("Invalid priority byte: {0:#04x}")]
    InvalidPriority(u8),
}

pub type Result<T> = std::result::Result<T, ModelError>;
