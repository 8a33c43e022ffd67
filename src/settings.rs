// Machine configuration: the line-oriented config file format, the fixed
// autotest entry state, and the runtime option switches that used to be
// process-wide globals and now travel with the CPU by value.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::fields::{LogicalAddress, PhysicalAddress};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("couldn't load {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed parsing {}:{line}: {text}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        text: String,
    },
}

/// Diagnostic switches threaded through the core instead of a global.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    pub log_exceptions: bool,
    pub crash_on_exception: bool,
    pub crash_on_page_fault: bool,
    pub crash_on_general_protection_fault: bool,
    pub trace: bool,
    pub memdebug: bool,
    pub iopeek: bool,
    pub pedebug: bool,
    pub log_page_translations: bool,
}

/// Geometry handed to the (out-of-scope) disk drive model.
#[derive(Debug, Clone, Default)]
pub struct DriveGeometry {
    pub image_path: PathBuf,
    pub sectors_per_track: u16,
    pub heads: u16,
    pub sectors: u32,
    pub bytes_per_sector: u16,
    pub floppy_type_for_cmos: u8,
}

struct FloppyType {
    name: &'static str,
    sectors_per_track: u16,
    heads: u16,
    sectors: u32,
    bytes_per_sector: u16,
    media_type: u8,
}

static FLOPPY_TYPES: [FloppyType; 6] = [
    FloppyType { name: "1.44M", sectors_per_track: 18, heads: 2, sectors: 2880, bytes_per_sector: 512, media_type: 4 },
    FloppyType { name: "720kB", sectors_per_track: 9, heads: 2, sectors: 1440, bytes_per_sector: 512, media_type: 3 },
    FloppyType { name: "1.2M", sectors_per_track: 15, heads: 2, sectors: 2400, bytes_per_sector: 512, media_type: 2 },
    FloppyType { name: "360kB", sectors_per_track: 9, heads: 2, sectors: 720, bytes_per_sector: 512, media_type: 1 },
    FloppyType { name: "320kB", sectors_per_track: 8, heads: 2, sectors: 640, bytes_per_sector: 512, media_type: 0 },
    FloppyType { name: "160kB", sectors_per_track: 8, heads: 1, sectors: 320, bytes_per_sector: 512, media_type: 0 },
];

/// Everything the machine needs to build itself: memory size, entry state,
/// files to preload, ROM images, drive geometry and the keymap path.
#[derive(Debug, Clone)]
pub struct Settings {
    pub memory_size: u32,
    pub entry_cs: u16,
    pub entry_ip: u16,
    pub entry_ds: Option<u16>,
    pub entry_ss: Option<u16>,
    pub entry_sp: Option<u16>,
    pub files: Vec<(PhysicalAddress, PathBuf)>,
    pub rom_images: Vec<(PhysicalAddress, PathBuf)>,
    pub keymap: Option<PathBuf>,
    pub floppies: [Option<DriveGeometry>; 2],
    pub fixed_disks: [Option<DriveGeometry>; 2],
    pub for_autotest: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            memory_size: 8192 * 1024,
            // IBM PCs boot here, which usually contains a JMP to the BIOS
            // entry point.
            entry_cs: 0xf000,
            entry_ip: 0xfff0,
            entry_ds: None,
            entry_ss: None,
            entry_sp: None,
            files: Vec::new(),
            rom_images: Vec::new(),
            keymap: None,
            floppies: [None, None],
            fixed_disks: [None, None],
            for_autotest: false,
        }
    }
}

fn parse_real_mode_address(text: &str) -> Option<PhysicalAddress> {
    let mut parts = text.split(':');
    let segment = u16::from_str_radix(parts.next()?, 16).ok()?;
    let offset = u32::from_str_radix(parts.next()?, 16).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(PhysicalAddress::from_real_mode(LogicalAddress::new(
        segment, offset,
    )))
}

impl Settings {
    pub fn entry(&self) -> LogicalAddress {
        LogicalAddress::new(self.entry_cs, self.entry_ip as u32)
    }

    /// Fixed load state for a single flat test binary; opcode 0xF1 ends the
    /// run.
    pub fn for_autotest(image: PathBuf) -> Settings {
        let mut settings = Settings {
            entry_cs: 0x1000,
            entry_ip: 0x0000,
            entry_ds: Some(0x1000),
            entry_ss: Some(0x9000),
            entry_sp: Some(0x1000),
            for_autotest: true,
            ..Settings::default()
        };
        settings.files.push((
            PhysicalAddress::from_real_mode(LogicalAddress::new(0x1000, 0x0000)),
            image,
        ));
        settings
    }

    pub fn from_file(path: &Path) -> Result<Settings, SettingsError> {
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut settings = Settings::default();

        for (index, line) in contents.lines().enumerate() {
            let line_number = index + 1;
            if line.starts_with('#') {
                continue;
            }
            let mut arguments = line.split_whitespace();
            let command = match arguments.next() {
                Some(command) => command,
                None => continue,
            };
            let arguments: Vec<&str> = arguments.collect();

            let success = match command {
                "load-file" => settings.handle_load_file(&arguments),
                "rom-image" => settings.handle_rom_image(&arguments),
                "memory-size" => settings.handle_memory_size(&arguments),
                "fixed-disk" => settings.handle_fixed_disk(&arguments),
                "floppy-disk" => settings.handle_floppy_disk(&arguments),
                "keymap" => settings.handle_keymap(&arguments),
                _ => false,
            };

            if !success {
                log::error!(
                    target: "config",
                    "failed parsing {}:{} {}",
                    path.display(),
                    line_number,
                    line
                );
                return Err(SettingsError::Parse {
                    path: path.to_path_buf(),
                    line: line_number,
                    text: line.to_string(),
                });
            }
        }

        Ok(settings)
    }

    fn handle_load_file(&mut self, arguments: &[&str]) -> bool {
        // load-file <segment:offset> <path/to/file>
        if arguments.len() != 2 {
            return false;
        }
        let address = match parse_real_mode_address(arguments[0]) {
            Some(address) => address,
            None => return false,
        };
        self.files.push((address, PathBuf::from(arguments[1])));
        true
    }

    fn handle_rom_image(&mut self, arguments: &[&str]) -> bool {
        // rom-image <hex-physical-address> <path/to/file>
        if arguments.len() != 2 {
            return false;
        }
        let address = match u32::from_str_radix(arguments[0].trim_start_matches("0x"), 16) {
            Ok(address) => address,
            Err(_) => return false,
        };
        self.rom_images
            .push((PhysicalAddress(address), PathBuf::from(arguments[1])));
        true
    }

    fn handle_memory_size(&mut self, arguments: &[&str]) -> bool {
        // memory-size <KiB>
        if arguments.len() != 1 {
            return false;
        }
        match arguments[0].parse::<u32>() {
            Ok(size) => {
                self.memory_size = size * 1024;
                true
            }
            Err(_) => false,
        }
    }

    fn handle_keymap(&mut self, arguments: &[&str]) -> bool {
        // keymap <path/to/file>
        if arguments.len() != 1 {
            return false;
        }
        let path = PathBuf::from(arguments[0]);
        if !path.exists() {
            return false;
        }
        log::info!(target: "config", "keymap {}", path.display());
        self.keymap = Some(path);
        true
    }

    fn handle_fixed_disk(&mut self, arguments: &[&str]) -> bool {
        // fixed-disk <index> <path/to/file> <size-KiB>
        if arguments.len() != 3 {
            return false;
        }
        let index = match arguments[0].parse::<usize>() {
            Ok(index) if index <= 1 => index,
            _ => return false,
        };
        let size = match arguments[2].parse::<u32>() {
            Ok(size) => size,
            Err(_) => return false,
        };

        let geometry = DriveGeometry {
            image_path: PathBuf::from(arguments[1]),
            sectors_per_track: 63,
            heads: 16,
            bytes_per_sector: 512,
            sectors: size * 1024 / 512,
            floppy_type_for_cmos: 0,
        };
        log::info!(
            target: "config",
            "fixed disk {}: {} ({} KiB)",
            index,
            geometry.image_path.display(),
            size
        );
        self.fixed_disks[index] = Some(geometry);
        true
    }

    fn handle_floppy_disk(&mut self, arguments: &[&str]) -> bool {
        // floppy-disk <index> <type> <path/to/file>
        if arguments.len() != 3 {
            return false;
        }
        let index = match arguments[0].parse::<usize>() {
            Ok(index) if index <= 1 => index,
            _ => return false,
        };
        let floppy_type = match FLOPPY_TYPES.iter().find(|ft| ft.name == arguments[1]) {
            Some(floppy_type) => floppy_type,
            None => {
                log::error!(target: "config", "invalid floppy type: \"{}\"", arguments[1]);
                return false;
            }
        };

        let geometry = DriveGeometry {
            image_path: PathBuf::from(arguments[2]),
            sectors_per_track: floppy_type.sectors_per_track,
            heads: floppy_type.heads,
            sectors: floppy_type.sectors,
            bytes_per_sector: floppy_type.bytes_per_sector,
            floppy_type_for_cmos: floppy_type.media_type,
        };
        log::info!(
            target: "config",
            "floppy {}: {} ({}spt, {}h, {}s ({}b))",
            index,
            geometry.image_path.display(),
            geometry.sectors_per_track,
            geometry.heads,
            geometry.sectors,
            geometry.bytes_per_sector
        );
        self.floppies[index] = Some(geometry);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "em86-settings-test-{}-{:?}.cfg",
            std::process::id(),
            std::thread::current().id()
        ));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_a_full_config() {
        let path = write_config(
            "# a comment\n\
             memory-size 4096\n\
             load-file 1000:0000 boot.bin\n\
             rom-image f0000 bios.rom\n\
             floppy-disk 0 1.44M disk.img\n\
             fixed-disk 1 hd.img 20480\n",
        );
        let settings = Settings::from_file(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(settings.memory_size, 4096 * 1024);
        assert_eq!(settings.files.len(), 1);
        assert_eq!(settings.files[0].0, PhysicalAddress(0x10000));
        assert_eq!(settings.rom_images[0].0, PhysicalAddress(0xf0000));
        let floppy = settings.floppies[0].as_ref().unwrap();
        assert_eq!(floppy.sectors_per_track, 18);
        assert_eq!(floppy.sectors, 2880);
        let fixed = settings.fixed_disks[1].as_ref().unwrap();
        assert_eq!(fixed.heads, 16);
        assert_eq!(fixed.sectors_per_track, 63);
        assert_eq!(fixed.sectors, 20480 * 2);
        assert_eq!(settings.entry_cs, 0xf000);
        assert_eq!(settings.entry_ip, 0xfff0);
    }

    #[test]
    fn bad_lines_are_errors() {
        let path = write_config("memory-size lots\n");
        let result = Settings::from_file(&path);
        fs::remove_file(&path).ok();
        assert!(matches!(result, Err(SettingsError::Parse { line: 1, .. })));
    }

    #[test]
    fn autotest_entry_state() {
        let settings = Settings::for_autotest(PathBuf::from("test.bin"));
        assert!(settings.for_autotest);
        assert_eq!(settings.entry_cs, 0x1000);
        assert_eq!(settings.entry_ip, 0x0000);
        assert_eq!(settings.entry_ss, Some(0x9000));
        assert_eq!(settings.entry_sp, Some(0x1000));
        assert_eq!(settings.files[0].0, PhysicalAddress(0x10000));
    }
}
