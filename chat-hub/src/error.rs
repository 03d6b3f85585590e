use thiserror::Error;

/// Why a nickname could not be registered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("nickname cannot be empty")]
    NicknameEmpty,
    #[error("nickname '{0}' may not contain whitespace, commas, or control characters")]
    NicknameInvalid(String),
    #[error("nickname '{0}' is already in use")]
    NicknameTaken(String),
}

/// A session mailbox refused a message. Either way the recipient is dropped.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("recipient is not keeping up with its outbound queue")]
    Backlogged,
    #[error("recipient connection is closed")]
    Closed,
}

/// Private message failures; the display text is the reply shown to the sender.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PrivateMessageError {
    #[error("Invalid PM format. Use: PM <username> <message>")]
    Malformed,
    #[error("You cannot send a private message to yourself.")]
    SelfTarget,
    #[error("Error: User '{0}' not found.")]
    UnknownTarget(String),
    #[error("An error occurred while sending your PM.")]
    Undeliverable(String),
}
