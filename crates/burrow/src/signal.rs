//! Process signals carried by `signal` channel requests.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A POSIX signal as named by the SSH connection protocol (RFC 4254 §6.10).
///
/// Signal names travel without the `SIG` prefix, so `Signal::Int` is `"INT"`
/// on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Abrt,
    Alrm,
    Fpe,
    Hup,
    Ill,
    Int,
    Kill,
    Pipe,
    Quit,
    Segv,
    Term,
    Usr1,
    Usr2,
}

impl Signal {
    /// Every signal the protocol defines, in RFC order.
    pub const ALL: [Signal; 13] = [
        Signal::Abrt,
        Signal::Alrm,
        Signal::Fpe,
        Signal::Hup,
        Signal::Ill,
        Signal::Int,
        Signal::Kill,
        Signal::Pipe,
        Signal::Quit,
        Signal::Segv,
        Signal::Term,
        Signal::Usr1,
        Signal::Usr2,
    ];

    /// Returns the protocol name of the signal.
    pub const fn as_str(self) -> &'static str {
        match self {
            Signal::Abrt => "ABRT",
            Signal::Alrm => "ALRM",
            Signal::Fpe => "FPE",
            Signal::Hup => "HUP",
            Signal::Ill => "ILL",
            Signal::Int => "INT",
            Signal::Kill => "KILL",
            Signal::Pipe => "PIPE",
            Signal::Quit => "QUIT",
            Signal::Segv => "SEGV",
            Signal::Term => "TERM",
            Signal::Usr1 => "USR1",
            Signal::Usr2 => "USR2",
        }
    }

    /// Maps a protocol signal name to a [`Signal`].
    ///
    /// Returns `None` for names outside the protocol's list; callers treat
    /// those as undeliverable rather than as errors.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|sig| sig.as_str() == name)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown signal name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown signal: {0}")]
pub struct UnknownSignal(pub String);

impl FromStr for Signal {
    type Err = UnknownSignal;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| UnknownSignal(s.to_string()))
    }
}

/// Maps russh's signal type onto the protocol name it was parsed from.
pub(crate) fn russh_signal_name(sig: &russh::Sig) -> String {
    use russh::Sig;

    match sig {
        Sig::ABRT => "ABRT".to_string(),
        Sig::ALRM => "ALRM".to_string(),
        Sig::FPE => "FPE".to_string(),
        Sig::HUP => "HUP".to_string(),
        Sig::ILL => "ILL".to_string(),
        Sig::INT => "INT".to_string(),
        Sig::KILL => "KILL".to_string(),
        Sig::PIPE => "PIPE".to_string(),
        Sig::QUIT => "QUIT".to_string(),
        Sig::SEGV => "SEGV".to_string(),
        Sig::TERM => "TERM".to_string(),
        Sig::USR1 => "USR1".to_string(),
        Sig::Custom(name) => name.clone(),
    }
}
