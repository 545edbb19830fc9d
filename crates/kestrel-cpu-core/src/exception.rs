use core::fmt;

/// CPU fault reported back to the instruction dispatcher.
///
/// The segmentation unit never vectors a fault itself; it returns the
/// exception to the caller, which decides whether to deliver it through the
/// IDT or (for debugger probes) discard it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// #DE
    DivideError,
    /// #DF
    DoubleFault,
    /// #TS(error_code)
    InvalidTss(u16),
    /// #NP(error_code)
    NotPresent(u16),
    /// #SS(error_code)
    StackFault(u16),
    /// #GP(error_code)
    GeneralProtection(u16),
}

impl Exception {
    #[inline]
    pub fn gp0() -> Self {
        Self::GeneralProtection(0)
    }

    #[inline]
    pub fn gp(sel: u16) -> Self {
        Self::GeneralProtection(sel)
    }

    #[inline]
    pub fn np(sel: u16) -> Self {
        Self::NotPresent(sel)
    }

    #[inline]
    pub fn ss(sel: u16) -> Self {
        Self::StackFault(sel)
    }

    #[inline]
    pub fn ts(sel: u16) -> Self {
        Self::InvalidTss(sel)
    }

    /// The IDT vector this fault is delivered through.
    pub fn vector(self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::DoubleFault => 8,
            Exception::InvalidTss(_) => 10,
            Exception::NotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
        }
    }

    /// The error code the CPU pushes for this fault, if it pushes one.
    pub fn error_code(self) -> Option<u16> {
        match self {
            Exception::DivideError => None,
            Exception::DoubleFault => Some(0),
            Exception::InvalidTss(code)
            | Exception::NotPresent(code)
            | Exception::StackFault(code)
            | Exception::GeneralProtection(code) => Some(code),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exception::DivideError => write!(f, "#DE"),
            Exception::DoubleFault => write!(f, "#DF"),
            Exception::InvalidTss(code) => write!(f, "#TS({code:#06x})"),
            Exception::NotPresent(code) => write!(f, "#NP({code:#06x})"),
            Exception::StackFault(code) => write!(f, "#SS({code:#06x})"),
            Exception::GeneralProtection(code) => write!(f, "#GP({code:#06x})"),
        }
    }
}

impl std::error::Error for Exception {}
