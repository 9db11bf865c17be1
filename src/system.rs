//! Discovery of the Windows and system directories on the host
//!
//! On Windows the real directories are queried through the API. Elsewhere the
//! usual environment variables are consulted, so a mounted Windows tree can
//! still be walked; absent those, system lookups simply find nothing.

use std::path::PathBuf;

#[cfg(windows)]
mod imp {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;
    use std::path::PathBuf;

    fn get_winapi_directory(
        a: unsafe extern "system" fn(
            winapi::um::winnt::LPWSTR,
            winapi::shared::minwindef::UINT,
        ) -> winapi::shared::minwindef::UINT,
    ) -> Option<PathBuf> {
        const BFR_SIZE: usize = 512;
        let mut bfr: [u16; BFR_SIZE] = [0; BFR_SIZE];

        let ret: u32 = unsafe { a(bfr.as_mut_ptr(), BFR_SIZE as u32) };
        if ret == 0 {
            None
        } else {
            Some(PathBuf::from(OsString::from_wide(&bfr[..ret as usize])))
        }
    }

    pub fn windows_directory() -> Option<PathBuf> {
        get_winapi_directory(winapi::um::sysinfoapi::GetWindowsDirectoryW)
    }

    pub fn system_directory() -> Option<PathBuf> {
        get_winapi_directory(winapi::um::sysinfoapi::GetSystemDirectoryW)
    }

    /// The 32-bit system directory of a 64-bit host, if there is one
    pub fn wow64_directory() -> Option<PathBuf> {
        get_winapi_directory(winapi::um::sysinfoapi::GetSystemWow64DirectoryW)
            .filter(|p| p.is_dir())
    }
}

#[cfg(not(windows))]
mod imp {
    use std::path::PathBuf;

    fn windows_root() -> Option<PathBuf> {
        for var in ["WINDIR", "SYSTEMROOT"] {
            if let Ok(dir) = std::env::var(var) {
                let p = PathBuf::from(dir);
                if p.is_dir() {
                    return Some(p);
                }
            }
        }
        None
    }

    pub fn windows_directory() -> Option<PathBuf> {
        windows_root()
    }

    pub fn system_directory() -> Option<PathBuf> {
        windows_root().map(|r| r.join("System32")).filter(|p| p.is_dir())
    }

    pub fn wow64_directory() -> Option<PathBuf> {
        windows_root().map(|r| r.join("SysWOW64")).filter(|p| p.is_dir())
    }
}

pub fn windows_directory() -> Option<PathBuf> {
    imp::windows_directory()
}

pub fn system_directory() -> Option<PathBuf> {
    imp::system_directory()
}

pub fn wow64_directory() -> Option<PathBuf> {
    imp::wow64_directory()
}
