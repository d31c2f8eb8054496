/// A place-holder for perhaps a more detailed/robust error reporting system in
/// the future. Every error produced by the executor core is fatal to the
/// process, the message is what ends up in the diagnostic

#[derive(Debug, Clone, PartialEq)]
pub struct ExecErr {
    message: String,
}

impl ExecErr {
    pub fn from(message: &str) -> Self {
        ExecErr {
            message: message.to_string(),
        }
    }

    /// Same as `from` but tacks on whatever `errno` currently says, use this
    /// immediately after the failing libc call so nothing clobbers it
    pub fn from_os(message: &str) -> Self {
        let os_err = std::io::Error::last_os_error();
        ExecErr {
            message: format!("{} ({})", message, os_err),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn display(&self) {
        println!("{}", self.message);
    }
}

impl std::fmt::Display for ExecErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
