use thiserror::Error;

/// Errors that can occur while declaring or registering modules and classes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("names exposed to scripts must not be empty")]
    EmptyName,

    #[error("module '{name}' is already registered")]
    DuplicateModule { name: String },

    #[error("module '{module}' declares '{name}' more than once")]
    DuplicateMember { module: String, name: String },

    #[error("class '{class}' declares member '{name}' more than once")]
    DuplicateClassMember { class: String, name: String },

    #[error("class '{name}' is already registered")]
    DuplicateClass { name: String },

    #[error("'{name}' is reserved and cannot be declared")]
    ReservedName { name: String },

    #[error("class registry is sealed; '{name}' cannot be added after installation")]
    Sealed { name: String },
}
