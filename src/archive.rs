//! DFU archive (`.zip`) reader: opens the package, parses `manifest.json`,
//! and exposes the up-to-four lazy byte streams it names (init packet and
//! firmware image, for each of the SoftDevice+Bootloader and application
//! update phases).

use std::io::{Cursor, Read};

use serde::Deserialize;
use zip::ZipArchive;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct ImagePair {
    dat_file: String,
    bin_file: String,
}

#[derive(Debug, Deserialize)]
struct ManifestBody {
    application: Option<ImagePair>,
    #[serde(alias = "bootloader")]
    softdevice_bootloader: Option<ImagePair>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    manifest: ManifestBody,
}

/// One init-packet + firmware-image pair, read fully into memory so the
/// object-transfer procedure can seek back to the start for resume
/// (`zip::read::ZipFile` itself is sequential-only).
pub struct Image {
    pub init_packet: Cursor<Vec<u8>>,
    pub init_packet_len: u64,
    pub firmware: Cursor<Vec<u8>>,
    pub firmware_len: u64,
}

/// The two upgrade phases a DFU archive may carry: the combined
/// SoftDevice+Bootloader image, and the application image. Either may be
/// absent; at least one must be present.
pub struct DfuArchive {
    pub softdevice_bootloader: Option<Image>,
    pub application: Option<Image>,
}

impl DfuArchive {
    pub fn open(path: &str) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut zip = ZipArchive::new(file)?;

        let manifest_text = {
            let mut entry = zip.by_name("manifest.json")?;
            let mut s = String::new();
            entry.read_to_string(&mut s)?;
            s
        };
        let manifest: Manifest = serde_json::from_str(&manifest_text)?;

        let softdevice_bootloader = manifest
            .manifest
            .softdevice_bootloader
            .map(|pair| read_image(&mut zip, &pair))
            .transpose()?;
        let application = manifest
            .manifest
            .application
            .map(|pair| read_image(&mut zip, &pair))
            .transpose()?;

        if softdevice_bootloader.is_none() && application.is_none() {
            return Err(Error::Archive(
                "manifest.json names neither an application nor a softdevice_bootloader image"
                    .into(),
            ));
        }

        Ok(Self { softdevice_bootloader, application })
    }
}

fn read_image(zip: &mut ZipArchive<std::fs::File>, pair: &ImagePair) -> Result<Image> {
    let init_packet = read_entry(zip, &pair.dat_file)?;
    let firmware = read_entry(zip, &pair.bin_file)?;
    let init_packet_len = init_packet.len() as u64;
    let firmware_len = firmware.len() as u64;
    Ok(Image {
        init_packet: Cursor::new(init_packet),
        init_packet_len,
        firmware: Cursor::new(firmware),
        firmware_len,
    })
}

fn read_entry(zip: &mut ZipArchive<std::fs::File>, name: &str) -> Result<Vec<u8>> {
    let mut entry = zip.by_name(name)?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    /// Build a DFU package with the given manifest body and entries inside
    /// a fresh temp dir that is removed when the returned guard drops.
    fn build_archive(
        dir: &TempDir,
        manifest_json: &str,
        entries: &[(&str, &[u8])],
    ) -> std::path::PathBuf {
        let zip_path = dir.path().join("package.zip");
        let file = std::fs::File::create(&zip_path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

        zip.start_file("manifest.json", options).unwrap();
        zip.write_all(manifest_json.as_bytes()).unwrap();

        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
        zip_path
    }

    #[test]
    fn application_only_manifest_opens() {
        let dir = TempDir::new().unwrap();
        let manifest = r#"{"manifest":{"application":{"dat_file":"app.dat","bin_file":"app.bin"}}}"#;
        let path = build_archive(&dir, manifest, &[("app.dat", b"init"), ("app.bin", b"firmware-bytes")]);

        let archive = DfuArchive::open(path.to_str().unwrap()).unwrap();
        assert!(archive.softdevice_bootloader.is_none());
        let app = archive.application.unwrap();
        assert_eq!(app.init_packet_len, 4);
        assert_eq!(app.firmware_len, 14);
    }

    #[test]
    fn bootloader_alias_key_is_accepted() {
        let dir = TempDir::new().unwrap();
        let manifest =
            r#"{"manifest":{"bootloader":{"dat_file":"sd.dat","bin_file":"sd.bin"}}}"#;
        let path = build_archive(&dir, manifest, &[("sd.dat", b"x"), ("sd.bin", b"y")]);

        let archive = DfuArchive::open(path.to_str().unwrap()).unwrap();
        assert!(archive.application.is_none());
        assert!(archive.softdevice_bootloader.is_some());
    }

    #[test]
    fn both_pairs_absent_is_an_error() {
        let dir = TempDir::new().unwrap();
        let manifest = r#"{"manifest":{}}"#;
        let path = build_archive(&dir, manifest, &[]);

        let err = DfuArchive::open(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }

    #[test]
    fn missing_entry_surfaces_as_zip_error() {
        let dir = TempDir::new().unwrap();
        let manifest =
            r#"{"manifest":{"application":{"dat_file":"missing.dat","bin_file":"missing.bin"}}}"#;
        let path = build_archive(&dir, manifest, &[]);

        let err = DfuArchive::open(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Zip(_)));
    }
}
