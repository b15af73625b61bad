//! Installer family detection and silent switch generation
//!
//! Recognizes the common Windows installer builders (NSIS, Inno Setup,
//! InstallShield, MSI packages) from file contents or the file name and
//! produces the switches that run them unattended.

use std::io::Read;
use std::path::Path;

/// How many leading bytes are searched for builder signatures
const SIGNATURE_WINDOW: usize = 32 * 1024;

/// Installer family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerType {
    /// NSIS (Nullsoft Scriptable Install System)
    Nsis,
    InnoSetup,
    InstallShield,
    /// Windows Installer package, run through `msiexec`
    Msi,
    Generic,
}

impl InstallerType {
    pub fn display_name(&self) -> &'static str {
        match self {
            InstallerType::Nsis => "NSIS",
            InstallerType::InnoSetup => "Inno Setup",
            InstallerType::InstallShield => "InstallShield",
            InstallerType::Msi => "Windows Installer",
            InstallerType::Generic => "Generic",
        }
    }
}

/// Guess the installer family from its file name
pub fn detect_installer_type(filename: &str) -> InstallerType {
    let filename = filename.to_lowercase();

    if filename.ends_with(".msi") {
        return InstallerType::Msi;
    }
    if filename.contains("nsis") || filename.contains("nullsoft") {
        return InstallerType::Nsis;
    }
    // 7-Zip and friends ship NSIS builds
    if filename.starts_with("7z") && filename.ends_with(".exe") {
        return InstallerType::Nsis;
    }
    if filename.contains("inno") {
        return InstallerType::InnoSetup;
    }
    // Bare "Setup.exe" names are most often Inno Setup
    if filename == "setup.exe" || filename.ends_with("-setup.exe") || filename.ends_with("_setup.exe") {
        return InstallerType::InnoSetup;
    }
    if filename.contains("installshield") {
        return InstallerType::InstallShield;
    }

    InstallerType::Generic
}

/// Look for builder signatures near the start of the file
pub fn detect_from_file(path: &Path) -> Option<InstallerType> {
    let file = std::fs::File::open(path).ok()?;
    let mut buffer = Vec::with_capacity(SIGNATURE_WINDOW);
    file.take(SIGNATURE_WINDOW as u64).read_to_end(&mut buffer).ok()?;
    if buffer.is_empty() {
        return None;
    }

    // OLE compound document header
    if buffer.starts_with(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
        return Some(InstallerType::Msi);
    }

    let content = String::from_utf8_lossy(&buffer).to_lowercase();
    if content.contains("nullsoft") || content.contains("nsis") {
        Some(InstallerType::Nsis)
    } else if content.contains("inno setup") || content.contains("innosetup") {
        Some(InstallerType::InnoSetup)
    } else if content.contains("installshield") {
        Some(InstallerType::InstallShield)
    } else {
        None
    }
}

/// Detect from contents, falling back to the file name
pub fn detect(path: &Path) -> InstallerType {
    detect_from_file(path).unwrap_or_else(|| {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        detect_installer_type(&filename)
    })
}

/// Switches that make an installer of this family run without a UI
pub fn silent_switches(installer_type: InstallerType, unattended: bool) -> Vec<String> {
    if !unattended {
        return Vec::new();
    }

    let switches: &[&str] = match installer_type {
        InstallerType::Nsis => &["/S"],
        InstallerType::InnoSetup => &["/VERYSILENT", "/NORESTART", "/SP-"],
        InstallerType::InstallShield => &["/s"],
        InstallerType::Msi => &["/qn", "/norestart"],
        InstallerType::Generic => &["/q"],
    };
    switches.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn filename_heuristics() {
        assert_eq!(detect_installer_type("Product.MSI"), InstallerType::Msi);
        assert_eq!(detect_installer_type("7z2301-x64.exe"), InstallerType::Nsis);
        assert_eq!(detect_installer_type("Setup.exe"), InstallerType::InnoSetup);
        assert_eq!(detect_installer_type("game_setup.exe"), InstallerType::InnoSetup);
        assert_eq!(
            detect_installer_type("installshield-wizard.exe"),
            InstallerType::InstallShield
        );
        assert_eq!(detect_installer_type("tool.exe"), InstallerType::Generic);
    }

    #[test]
    fn signatures_win_over_filename() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Setup.exe");
        std::fs::write(&path, b"MZ\x90\x00 ... Nullsoft Install System v3.08 ...").unwrap();
        assert_eq!(detect(&path), InstallerType::Nsis);

        let msi = dir.path().join("package.bin");
        std::fs::write(&msi, [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1, 0, 0]).unwrap();
        assert_eq!(detect(&msi), InstallerType::Msi);

        let plain = dir.path().join("setup.exe");
        std::fs::write(&plain, b"MZ plain").unwrap();
        assert_eq!(detect_from_file(&plain), None);
        assert_eq!(detect(&plain), InstallerType::InnoSetup);

        assert_eq!(detect_from_file(&dir.path().join("missing.exe")), None);
    }

    #[test]
    fn switches_only_when_unattended() {
        assert!(silent_switches(InstallerType::Nsis, false).is_empty());
        assert_eq!(silent_switches(InstallerType::Nsis, true), vec!["/S"]);
        assert_eq!(
            silent_switches(InstallerType::InnoSetup, true),
            vec!["/VERYSILENT", "/NORESTART", "/SP-"]
        );
        assert_eq!(silent_switches(InstallerType::Msi, true), vec!["/qn", "/norestart"]);
    }
}
