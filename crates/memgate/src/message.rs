//! Message text for each error domain.
//!
//! One resolver per domain, created on first use. On Windows the system
//! message tables are used (ntdll's for NTSTATUS values); elsewhere, and for
//! anything the system does not know, a small built-in table covers the codes
//! this crate produces.

use std::sync::OnceLock;

use memgate_proto::NtStatus;

use crate::error::{ErrorDomain, win32};

trait Resolver: Send + Sync {
    /// Raw message text, before normalisation.
    fn lookup(&self, value: u32) -> Option<String>;
}

struct Table(&'static [(u32, &'static str)]);

impl Resolver for Table {
    fn lookup(&self, value: u32) -> Option<String> {
        self.0
            .iter()
            .find(|(code, _)| *code == value)
            .map(|(_, text)| (*text).to_string())
    }
}

const DWORD_TABLE: &[(u32, &str)] = &[
    (win32::ERROR_SUCCESS, "The operation completed successfully.\r\n"),
    (win32::ERROR_FILE_NOT_FOUND, "The system cannot find the file specified.\r\n"),
    (win32::ERROR_ACCESS_DENIED, "Access is denied.\r\n"),
    (win32::ERROR_INVALID_HANDLE, "The handle is invalid.\r\n"),
    (
        win32::ERROR_NOT_ENOUGH_MEMORY,
        "Not enough memory resources are available to process this command.\r\n",
    ),
    (
        win32::ERROR_GEN_FAILURE,
        "A device attached to the system is not functioning.\r\n",
    ),
    (win32::ERROR_NOT_SUPPORTED, "The request is not supported.\r\n"),
    (win32::ERROR_INVALID_PARAMETER, "The parameter is incorrect.\r\n"),
    (
        win32::ERROR_DEVICE_ALREADY_ATTACHED,
        "The specified device object is already attached to another device.\r\n",
    ),
    (
        win32::ERROR_VERSION_PARSE_ERROR,
        "The version could not be parsed or did not match.\r\n",
    ),
];

const HRESULT_TABLE: &[(u32, &str)] = &[
    (0x8000_4001, "Not implemented\r\n"),
    (0x8000_4005, "Unspecified error\r\n"),
    (0x8007_000E, "Not enough memory resources are available to complete this operation.\r\n"),
    (0x8007_0057, "The parameter is incorrect.\r\n"),
];

const NTSTATUS_TABLE: &[(u32, &str)] = &[
    (
        NtStatus::PARTIAL_COPY.bits(),
        "{Partial Copy}\r\nDue to protection conflicts not all the requested bytes could be copied.",
    ),
    (
        NtStatus::UNSUCCESSFUL.bits(),
        "{Operation Failed}\r\nThe requested operation was unsuccessful.",
    ),
    (
        NtStatus::INVALID_HANDLE.bits(),
        "An invalid HANDLE was specified.",
    ),
    (
        NtStatus::INVALID_PARAMETER.bits(),
        "An invalid parameter was passed to a service or function.",
    ),
    (
        NtStatus::NO_MEMORY.bits(),
        "{Not Enough Quota}\r\nNot enough virtual memory or paging file quota is available to complete the specified operation.",
    ),
    (
        NtStatus::BUFFER_TOO_SMALL.bits(),
        "{Buffer Too Small}\r\nThe buffer is too small to contain the entry. No information has been written to the buffer.",
    ),
    (
        NtStatus::ACCESS_VIOLATION.bits(),
        "{EXCEPTION}\r\nAccess Violation\r\n",
    ),
    (
        NtStatus::PROCESS_IS_TERMINATING.bits(),
        "An attempt was made to access an exiting process.",
    ),
    (
        NtStatus::INVALID_BUFFER_SIZE.bits(),
        "The size of the buffer is invalid for the specified operation.",
    ),
    (NtStatus::NOT_FOUND.bits(), "The object was not found."),
];

#[cfg(target_os = "windows")]
mod system {
    use std::ffi::c_void;

    use windows::Win32::System::Diagnostics::Debug::{
        FORMAT_MESSAGE_FROM_HMODULE, FORMAT_MESSAGE_FROM_SYSTEM, FORMAT_MESSAGE_IGNORE_INSERTS,
        FormatMessageW,
    };
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::core::{PWSTR, w};

    use super::Resolver;

    /// `MAKELANGID(LANG_NEUTRAL, SUBLANG_DEFAULT)`
    const LANGUAGE: u32 = 0x0400;

    /// `FormatMessageW` over the system table, optionally a module's table.
    pub(super) struct SystemResolver {
        // HMODULE kept as an address so the resolver is Send + Sync.
        module: usize,
    }

    impl SystemResolver {
        pub(super) fn system() -> Self {
            Self { module: 0 }
        }

        pub(super) fn ntdll() -> Self {
            // SAFETY: ntdll is mapped into every process for its lifetime.
            let module = unsafe { GetModuleHandleW(w!("ntdll.dll")) }
                .map(|module| module.0 as usize)
                .unwrap_or(0);
            Self { module }
        }
    }

    impl Resolver for SystemResolver {
        fn lookup(&self, value: u32) -> Option<String> {
            let mut buffer = [0u16; 1024];
            let mut flags = FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_IGNORE_INSERTS;
            let source = if self.module != 0 {
                flags |= FORMAT_MESSAGE_FROM_HMODULE;
                Some(self.module as *const c_void)
            } else {
                None
            };
            // SAFETY: the buffer length passed matches the buffer.
            let len = unsafe {
                FormatMessageW(
                    flags,
                    source,
                    value,
                    LANGUAGE,
                    PWSTR(buffer.as_mut_ptr()),
                    buffer.len() as u32,
                    None,
                )
            };
            (len != 0).then(|| String::from_utf16_lossy(&buffer[..len as usize]))
        }
    }
}

fn table(domain: ErrorDomain) -> Table {
    match domain {
        ErrorDomain::Dword => Table(DWORD_TABLE),
        ErrorDomain::HResult => Table(HRESULT_TABLE),
        ErrorDomain::NtStatus => Table(NTSTATUS_TABLE),
    }
}

#[cfg(target_os = "windows")]
fn create(domain: ErrorDomain) -> Box<dyn Resolver> {
    match domain {
        ErrorDomain::Dword | ErrorDomain::HResult => Box::new(system::SystemResolver::system()),
        ErrorDomain::NtStatus => Box::new(system::SystemResolver::ntdll()),
    }
}

#[cfg(not(target_os = "windows"))]
fn create(domain: ErrorDomain) -> Box<dyn Resolver> {
    Box::new(table(domain))
}

fn resolver(domain: ErrorDomain) -> &'static dyn Resolver {
    static DWORD: OnceLock<Box<dyn Resolver>> = OnceLock::new();
    static HRESULT: OnceLock<Box<dyn Resolver>> = OnceLock::new();
    static NTSTATUS: OnceLock<Box<dyn Resolver>> = OnceLock::new();

    let cell = match domain {
        ErrorDomain::Dword => &DWORD,
        ErrorDomain::HResult => &HRESULT,
        ErrorDomain::NtStatus => &NTSTATUS,
    };
    &**cell.get_or_init(|| create(domain))
}

fn unknown(domain: ErrorDomain) -> String {
    let label = match domain {
        ErrorDomain::Dword => "DWORD",
        ErrorDomain::HResult => "HRESULT",
        ErrorDomain::NtStatus => "NTSTATUS",
    };
    format!("Unknown {label} value.")
}

/// Reduce raw message text to its first sentence, terminated by '.'.
///
/// NTSTATUS texts often start with a `{Title}`; only the title is kept.
pub fn normalize(domain: ErrorDomain, raw: &str) -> Option<String> {
    let mut text = raw.trim_start();
    let stops: &[char] = if domain == ErrorDomain::NtStatus {
        text = text.strip_prefix('{').unwrap_or(text);
        &['}', '.', '\r', '\n']
    } else {
        &['.', '\r', '\n']
    };
    let end = text.find(stops).unwrap_or(text.len());
    let sentence = text[..end].trim_end();
    (!sentence.is_empty()).then(|| format!("{sentence}."))
}

/// Message for `value` in `domain`.
pub fn resolve(domain: ErrorDomain, value: u32) -> String {
    resolver(domain)
        .lookup(value)
        .or_else(|| table(domain).lookup(value))
        .and_then(|raw| normalize(domain, &raw))
        .unwrap_or_else(|| unknown(domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_cuts_first_sentence() {
        assert_eq!(
            normalize(ErrorDomain::Dword, "Access is denied.\r\n").as_deref(),
            Some("Access is denied.")
        );
        assert_eq!(
            normalize(ErrorDomain::HResult, "Unspecified error\r\n").as_deref(),
            Some("Unspecified error.")
        );
        assert_eq!(normalize(ErrorDomain::Dword, "\r\n"), None);
    }

    #[test]
    fn test_normalize_ntstatus_title() {
        assert_eq!(
            normalize(
                ErrorDomain::NtStatus,
                "{Buffer Too Small}\r\nThe buffer is too small to contain the entry."
            )
            .as_deref(),
            Some("Buffer Too Small.")
        );
        assert_eq!(
            normalize(ErrorDomain::NtStatus, "The object was not found.").as_deref(),
            Some("The object was not found.")
        );
    }

    #[test]
    fn test_table_lookup() {
        let table = Table(NTSTATUS_TABLE);
        assert!(table.lookup(NtStatus::NOT_FOUND.bits()).is_some());
        assert!(table.lookup(0xDEAD_BEEF).is_none());
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn test_resolve_builtin() {
        assert_eq!(
            resolve(ErrorDomain::NtStatus, NtStatus::BUFFER_TOO_SMALL.bits()),
            "Buffer Too Small."
        );
        assert_eq!(
            resolve(ErrorDomain::Dword, win32::ERROR_ACCESS_DENIED),
            "Access is denied."
        );
        assert_eq!(resolve(ErrorDomain::Dword, 0xFFFF), "Unknown DWORD value.");
        assert_eq!(
            resolve(ErrorDomain::NtStatus, 0xC0DE_0000),
            "Unknown NTSTATUS value."
        );
    }
}
