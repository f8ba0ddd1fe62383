//! Host identity helpers.

use std::ffi::OsString;

pub fn gethostname() -> OsString {
    #[cfg(unix)]
    {
        let mut buf = vec![0u8; 256];
        let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if ret == 0 {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            OsString::from(String::from_utf8_lossy(&buf[..len]).to_string())
        } else {
            OsString::from("unknown")
        }
    }
    #[cfg(not(unix))]
    {
        OsString::from("unknown")
    }
}

/// Hostname with any domain suffix stripped (`mbp.local` → `mbp`). Used as
/// the advertised instance name and in `welcome`.
pub fn short_hostname() -> String {
    let raw = gethostname().to_string_lossy().into_owned();
    match raw.split('.').next() {
        Some(first) if !first.is_empty() => first.to_string(),
        _ => "unknown".to_string(),
    }
}
