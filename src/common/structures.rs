use core::fmt;

/// Coarse classes of syscall rejection. Kernel-internal invariant violations
/// are not represented: they halt the core's kernel path instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Capability,
    Authority,
    Consistency,
    Exhaustion,
    Argument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallError {
    // capability errors
    CapOutOfRange,
    CapNoOwner,
    CapUnallocated,
    CapUntrusted,
    // authority errors
    InvalidSpd,
    NotScheduler,
    NoSchedAuthority,
    NoTrust,
    ExclusiveResume,
    // consistency errors
    Outdated,
    SelfSwitch,
    UpcallNotReady,
    StaleLock,
    IllegalTailcall,
    WrongCpu,
    // resource exhaustion
    NoFreeThread,
    NoFreeMpd,
    NoFreeSpd,
    InvocationStackFull,
    TooManyNetBrands,
    // malformed requests
    InvalidThread,
    NotBrand,
    NotHwBrand,
    NotInCallPath,
    NotMember,
    SingletonSplit,
    CompositeUnavailable,
    InvalidEventIndex,
    NotSchedChild,
    PrivilegeNotHeld,
    SchedDepthExceeded,
    IllegalOperation,
}

impl SyscallError {
    pub fn category(self) -> ErrorCategory {
        use SyscallError::*;
        match self {
            CapOutOfRange | CapNoOwner | CapUnallocated | CapUntrusted => ErrorCategory::Capability,
            InvalidSpd | NotScheduler | NoSchedAuthority | NoTrust | ExclusiveResume => ErrorCategory::Authority,
            Outdated | SelfSwitch | UpcallNotReady | StaleLock | IllegalTailcall | WrongCpu => {
                ErrorCategory::Consistency
            }
            NoFreeThread | NoFreeMpd | NoFreeSpd | InvocationStackFull | TooManyNetBrands => ErrorCategory::Exhaustion,
            _ => ErrorCategory::Argument,
        }
    }

    /// Value placed in the caller's return register.
    pub fn errno(self) -> isize {
        match self {
            SyscallError::Outdated | SyscallError::SelfSwitch => 1,
            SyscallError::StaleLock => 2,
            SyscallError::UpcallNotReady => -2,
            _ => -1,
        }
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SyscallError::*;
        let s = match self {
            CapOutOfRange => "capability index out of range",
            CapNoOwner => "capability has no owner",
            CapUnallocated => "capability not allocated",
            CapUntrusted => "capability owner not in current composite",
            InvalidSpd => "claimed component is not the current one",
            NotScheduler => "component is not a scheduler",
            NoSchedAuthority => "scheduler has no authority over thread",
            NoTrust => "no trust relation between components",
            ExclusiveResume => "thread suspended exclusively by a more authoritative scheduler",
            Outdated => "scheduling decision outdated",
            SelfSwitch => "switch to the current thread",
            UpcallNotReady => "upcall thread not active",
            StaleLock => "stale lock owner",
            IllegalTailcall => "illegal use of tailcall",
            WrongCpu => "brand and thread are on different cores",
            NoFreeThread => "no free thread",
            NoFreeMpd => "no free composite descriptor",
            NoFreeSpd => "no free component slot",
            InvocationStackFull => "invocation stack full",
            TooManyNetBrands => "too many network brands",
            InvalidThread => "invalid thread",
            NotBrand => "thread is not a brand",
            NotHwBrand => "thread is not a hardware brand",
            NotInCallPath => "component not in the invocation stack",
            NotMember => "component not in the claimed composite",
            SingletonSplit => "cannot split a composite with one member",
            CompositeUnavailable => "composite deprecated or subordinate",
            InvalidEventIndex => "invalid event index",
            NotSchedChild => "target is not a child scheduler",
            PrivilegeNotHeld => "scheduling privilege not held",
            SchedDepthExceeded => "scheduler hierarchy too deep",
            IllegalOperation => "illegal operation",
        };
        f.write_str(s)
    }
}

pub type SyscallResult<T> = Result<T, SyscallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recompute_codes_are_distinct_from_failure() {
        assert_eq!(SyscallError::Outdated.errno(), 1);
        assert_eq!(SyscallError::UpcallNotReady.errno(), -2);
        assert_eq!(SyscallError::StaleLock.errno(), 2);
        assert_eq!(SyscallError::NotScheduler.errno(), -1);
        assert_eq!(SyscallError::Outdated.category(), ErrorCategory::Consistency);
        assert_eq!(SyscallError::NoFreeMpd.category(), ErrorCategory::Exhaustion);
        assert_eq!(SyscallError::CapUntrusted.category(), ErrorCategory::Capability);
    }
}
