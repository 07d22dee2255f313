//! Preload environment wiring
//!
//! Targets must load the time interception library so that every clock read
//! and every sleep becomes a real, traceable system call. The library is made
//! visible to them through `LD_PRELOAD`, which spawned programs inherit.

use std::env;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::Options;
use crate::error::{Result, TimewarpError};

/// File name of the interception library
pub const PRELOAD_LIBNAME: &str = "libtimewarp_preload.so";

const LD_PRELOAD: &str = "LD_PRELOAD";

/// Find the directory holding the interception library
///
/// An explicit `--libpath` must contain it. Otherwise the directory of the
/// running executable is tried, which is where cargo puts both artifacts.
pub fn locate_libpath(options: &Options) -> Result<PathBuf> {
    if let Some(dir) = &options.libpath {
        if dir.join(PRELOAD_LIBNAME).is_file() {
            return Ok(dir.clone());
        }
        return Err(TimewarpError::Config(format!(
            "{} not found in {}",
            PRELOAD_LIBNAME,
            dir.display()
        )));
    }

    let exe = env::current_exe()?;
    if let Some(dir) = exe.parent().filter(|d| d.join(PRELOAD_LIBNAME).is_file()) {
        return Ok(dir.to_path_buf());
    }

    Err(TimewarpError::Config(format!(
        "unable to locate {}, consider specifying --libpath or --no-preload",
        PRELOAD_LIBNAME
    )))
}

/// Value of `LD_PRELOAD` with `lib` taking precedence over `previous`
///
/// The loader splits the list on whitespace and honours the first entry.
pub fn preload_value(lib: &Path, previous: Option<&str>) -> String {
    match previous.map(str::trim).filter(|p| !p.is_empty()) {
        Some(previous) => format!("{} {}", lib.display(), previous),
        None => lib.display().to_string(),
    }
}

/// Prepend the library in `dir` to the tool's own `LD_PRELOAD`
pub fn extend_ld_preload(dir: &Path) -> String {
    let previous = env::var(LD_PRELOAD).ok();
    let value = preload_value(&dir.join(PRELOAD_LIBNAME), previous.as_deref());
    // Called once during startup, before any thread or child exists.
    env::set_var(LD_PRELOAD, &value);
    info!(ld_preload = %value, "preload library armed");
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs::File;

    #[test]
    fn test_preload_value_without_previous() {
        let lib = Path::new("/opt/tw/libtimewarp_preload.so");
        assert_eq!(preload_value(lib, None), "/opt/tw/libtimewarp_preload.so");
        assert_eq!(preload_value(lib, Some("  ")), "/opt/tw/libtimewarp_preload.so");
    }

    #[test]
    fn test_preload_value_prepends() {
        let lib = Path::new("/opt/tw/libtimewarp_preload.so");
        assert_eq!(
            preload_value(lib, Some("libother.so")),
            "/opt/tw/libtimewarp_preload.so libother.so"
        );
    }

    #[test]
    fn test_locate_explicit_libpath() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join(PRELOAD_LIBNAME)).unwrap();
        let options = Options {
            libpath: Some(dir.path().to_path_buf()),
            ..Options::default()
        };
        assert_eq!(locate_libpath(&options).unwrap(), dir.path());
    }

    #[test]
    fn test_locate_explicit_libpath_without_library() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options {
            libpath: Some(dir.path().to_path_buf()),
            ..Options::default()
        };
        let err = locate_libpath(&options).unwrap_err();
        assert!(matches!(err, TimewarpError::Config(_)));
        assert!(err.to_string().contains(PRELOAD_LIBNAME));
    }

    #[test]
    #[serial]
    fn test_extend_ld_preload_sets_environment() {
        let saved = env::var(LD_PRELOAD).ok();
        env::set_var(LD_PRELOAD, "libfirst.so");

        let value = extend_ld_preload(Path::new("/opt/tw"));
        assert_eq!(value, "/opt/tw/libtimewarp_preload.so libfirst.so");
        assert_eq!(env::var(LD_PRELOAD).unwrap(), value);

        match saved {
            Some(v) => env::set_var(LD_PRELOAD, v),
            None => env::remove_var(LD_PRELOAD),
        }
    }
}
