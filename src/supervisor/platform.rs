//! Per-platform rules for checking and starting a target.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::supervisor::LaunchError;

/// Launch strategy family, chosen once per run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformProfile {
    Darwin,
    Windows,
    Linux,
}

/// Program and arguments that start a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl LaunchCommand {
    fn direct(path: impl Into<OsString>) -> Self {
        Self {
            program: path.into(),
            args: Vec::new(),
        }
    }

    fn via(program: &str, leading: &[&str], path: &Path) -> Self {
        let mut args: Vec<OsString> = leading.iter().map(OsString::from).collect();
        args.push(path.as_os_str().to_os_string());
        Self {
            program: program.into(),
            args,
        }
    }
}

impl PlatformProfile {
    /// Profile of the host this binary was built for
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            PlatformProfile::Darwin
        } else if cfg!(windows) {
            PlatformProfile::Windows
        } else {
            PlatformProfile::Linux
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformProfile::Darwin => "darwin",
            PlatformProfile::Windows => "windows",
            PlatformProfile::Linux => "linux",
        }
    }

    /// Check that `path` names something this profile can start.
    ///
    /// Linux targets without the executable bit get it added.
    pub fn verify(&self, path: &Path) -> Result<(), LaunchError> {
        if !path.exists() {
            if *self == PlatformProfile::Linux && is_bare_name(path) && which::which(path).is_ok() {
                debug!(target = %path.display(), "Target found in PATH");
                return Ok(());
            }
            return Err(LaunchError::NotFound {
                path: path.to_path_buf(),
            });
        }

        match self {
            PlatformProfile::Darwin => {
                if has_extension(path, "app") {
                    let executable = bundle_executable(path)?;
                    if !is_executable(&executable) {
                        return Err(LaunchError::NotExecutable {
                            path: executable,
                            reason: "missing executable permission".to_string(),
                        });
                    }
                } else if !is_executable(path) {
                    return Err(LaunchError::NotExecutable {
                        path: path.to_path_buf(),
                        reason: "missing executable permission".to_string(),
                    });
                }
            }
            PlatformProfile::Windows => {
                if !["exe", "bat", "cmd"].iter().any(|ext| has_extension(path, ext)) {
                    return Err(LaunchError::NotExecutable {
                        path: path.to_path_buf(),
                        reason: "not a Windows executable".to_string(),
                    });
                }
            }
            PlatformProfile::Linux => {
                if path.is_file() && !is_executable(path) {
                    make_executable(path).map_err(|e| LaunchError::NotExecutable {
                        path: path.to_path_buf(),
                        reason: format!("cannot make file executable: {}", e),
                    })?;
                    info!(target = %path.display(), "Added executable permission");
                }
            }
        }
        Ok(())
    }

    /// How to start `path` under this profile
    pub fn command(&self, path: &Path) -> Result<LaunchCommand, LaunchError> {
        let command = match self {
            // the bundle's own executable, so the tracked pid is the app itself
            PlatformProfile::Darwin if has_extension(path, "app") => LaunchCommand::direct(bundle_executable(path)?),
            PlatformProfile::Windows if has_extension(path, "bat") || has_extension(path, "cmd") => {
                LaunchCommand::via("cmd", &["/C"], path)
            }
            PlatformProfile::Linux if has_extension(path, "sh") => LaunchCommand::via("bash", &[], path),
            PlatformProfile::Linux if is_bare_name(path) && !path.exists() => {
                let resolved: PathBuf = which::which(path).map_err(|_| LaunchError::NotFound {
                    path: path.to_path_buf(),
                })?;
                LaunchCommand::direct(resolved)
            }
            _ => LaunchCommand::direct(path.as_os_str()),
        };
        Ok(command)
    }
}

impl fmt::Display for PlatformProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "darwin" | "macos" | "mac" => Ok(PlatformProfile::Darwin),
            "windows" | "win" => Ok(PlatformProfile::Windows),
            "linux" => Ok(PlatformProfile::Linux),
            other => Err(format!("unknown platform profile '{}'", other)),
        }
    }
}

/// Main executable of a `.app` bundle.
///
/// Uses `CFBundleExecutable` from an XML `Info.plist`, falling back to
/// `Contents/MacOS/<bundle name>`.
pub fn bundle_executable(bundle: &Path) -> Result<PathBuf, LaunchError> {
    let contents = bundle.join("Contents");
    let plist = contents.join("Info.plist");
    let invalid = |reason: String| LaunchError::InvalidBundle {
        path: bundle.to_path_buf(),
        reason,
    };

    let raw = std::fs::read(&plist).map_err(|e| invalid(format!("cannot read Contents/Info.plist: {}", e)))?;
    let name = plist_string(&String::from_utf8_lossy(&raw), "CFBundleExecutable")
        .or_else(|| bundle.file_stem().map(|s| s.to_string_lossy().to_string()))
        .ok_or_else(|| invalid("no executable name".to_string()))?;

    let executable = contents.join("MacOS").join(&name);
    if !executable.is_file() {
        return Err(invalid(format!("missing Contents/MacOS/{}", name)));
    }
    Ok(executable)
}

/// Value of `<key>{key}</key><string>..</string>` in an XML plist
fn plist_string(xml: &str, key: &str) -> Option<String> {
    let after_key = &xml[xml.find(&format!("<key>{}</key>", key))?..];
    let start = after_key.find("<string>")? + "<string>".len();
    let len = after_key[start..].find("</string>")?;
    let value = after_key[start..start + len].trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn is_bare_name(path: &Path) -> bool {
    path.components().count() == 1 && !path.as_os_str().to_string_lossy().contains('/')
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_dir() || m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.exists()
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_profile_names() {
        assert_eq!("macos".parse::<PlatformProfile>(), Ok(PlatformProfile::Darwin));
        assert_eq!("Linux".parse::<PlatformProfile>(), Ok(PlatformProfile::Linux));
        assert!("beos".parse::<PlatformProfile>().is_err());
        assert_eq!(PlatformProfile::Windows.to_string(), "windows");
    }

    fn fake_bundle(root: &Path, name: &str, plist: &str, executable: &str) -> PathBuf {
        let bundle = root.join(format!("{}.app", name));
        let macos = bundle.join("Contents").join("MacOS");
        std::fs::create_dir_all(&macos).unwrap();
        std::fs::write(bundle.join("Contents").join("Info.plist"), plist).unwrap();
        std::fs::write(macos.join(executable), "#!/bin/sh\n").unwrap();
        make_executable(&macos.join(executable)).unwrap();
        bundle
    }

    #[test]
    fn test_darwin_bundle_launches_its_executable_directly() {
        let dir = tempdir().unwrap();
        let plist = "<?xml version=\"1.0\"?>\n<plist><dict>\n\
            <key>CFBundleName</key><string>Calculator</string>\n\
            <key>CFBundleExecutable</key>\n    <string>calc-bin</string>\n\
            </dict></plist>";
        let bundle = fake_bundle(dir.path(), "Calc", plist, "calc-bin");

        let darwin = PlatformProfile::Darwin.command(&bundle).unwrap();
        assert_eq!(
            darwin,
            LaunchCommand::direct(bundle.join("Contents").join("MacOS").join("calc-bin"))
        );
        assert!(PlatformProfile::Darwin.verify(&bundle).is_ok());

        // no CFBundleExecutable: the bundle name is used
        let plain = fake_bundle(dir.path(), "Notes", "<plist/>", "Notes");
        assert_eq!(
            bundle_executable(&plain).unwrap(),
            plain.join("Contents").join("MacOS").join("Notes")
        );
    }

    #[test]
    fn test_launch_commands() {

        let script = PlatformProfile::Linux.command(Path::new("/opt/run.sh")).unwrap();
        assert_eq!(script.program, OsString::from("bash"));
        assert_eq!(script.args, vec![OsString::from("/opt/run.sh")]);

        let batch = PlatformProfile::Windows.command(Path::new("C:\\app\\start.BAT")).unwrap();
        assert_eq!(batch.program, OsString::from("cmd"));

        let image = PlatformProfile::Linux.command(Path::new("/opt/App.AppImage")).unwrap();
        assert_eq!(image, LaunchCommand::direct("/opt/App.AppImage"));
    }

    #[test]
    fn test_missing_target() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nothing-here");
        assert!(matches!(
            PlatformProfile::Linux.verify(&missing),
            Err(LaunchError::NotFound { .. })
        ));
    }

    #[test]
    fn test_darwin_bundle_needs_info_plist() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("Fake.app");
        std::fs::create_dir_all(bundle.join("Contents")).unwrap();
        assert!(matches!(
            PlatformProfile::Darwin.verify(&bundle),
            Err(LaunchError::InvalidBundle { .. })
        ));
        std::fs::write(bundle.join("Contents").join("Info.plist"), "<plist/>").unwrap();
        // a plist alone is not enough without the executable it names
        assert!(matches!(
            PlatformProfile::Darwin.verify(&bundle),
            Err(LaunchError::InvalidBundle { .. })
        ));
        assert!(PlatformProfile::Darwin.command(&bundle).is_err());
    }

    #[test]
    fn test_windows_requires_executable_suffix() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("readme.txt");
        std::fs::write(&doc, "hi").unwrap();
        assert!(matches!(
            PlatformProfile::Windows.verify(&doc),
            Err(LaunchError::NotExecutable { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_linux_adds_executable_bit() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("target.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 1\n").unwrap();
        assert!(!is_executable(&script));
        PlatformProfile::Linux.verify(&script).unwrap();
        assert!(is_executable(&script));
    }

    #[cfg(unix)]
    #[test]
    fn test_linux_path_lookup() {
        assert!(PlatformProfile::Linux.verify(Path::new("sh")).is_ok());
        let cmd = PlatformProfile::Linux.command(Path::new("sh")).unwrap();
        assert!(Path::new(&cmd.program).is_absolute());
    }
}
