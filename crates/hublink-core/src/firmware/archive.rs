//! `firmware.zip` bundles.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use tracing::info;

use super::builder::FirmwareBuilder;
use super::compile::ScriptCompiler;
use super::metadata::FirmwareMetadata;
use super::{FirmwareError, FirmwareImage};

const BASE_ENTRY: &str = "firmware-base.bin";
const METADATA_ENTRY: &str = "firmware.metadata.json";
const SCRIPT_ENTRY: &str = "main.py";
const LICENSE_ENTRY: &str = "ReadMe_OSS.txt";

/// Contents of a firmware bundle.
#[derive(Debug, Clone)]
pub struct FirmwareArchive {
    pub base: Vec<u8>,
    pub metadata: FirmwareMetadata,
    /// Script to embed, 1.x images only.
    pub main_py: Option<String>,
    pub license: Option<String>,
}

impl FirmwareArchive {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FirmwareError> {
        Self::from_reader(File::open(path)?)
    }

    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self, FirmwareError> {
        let mut zip = zip::ZipArchive::new(reader)?;

        let base = read_entry(&mut zip, BASE_ENTRY)?
            .ok_or_else(|| FirmwareError::MissingEntry(BASE_ENTRY.into()))?;
        let raw = read_entry(&mut zip, METADATA_ENTRY)?
            .ok_or_else(|| FirmwareError::MissingEntry(METADATA_ENTRY.into()))?;
        let metadata = FirmwareMetadata::from_json(&raw)?;
        let main_py = read_entry(&mut zip, SCRIPT_ENTRY)?
            .map(|b| String::from_utf8_lossy(&b).into_owned());
        let license = read_entry(&mut zip, LICENSE_ENTRY)?
            .map(|b| String::from_utf8_lossy(&b).into_owned());

        info!(
            firmware = metadata.firmware_version(),
            schema = %metadata.schema_version(),
            base_size = base.len(),
            "Loaded firmware archive"
        );
        Ok(Self {
            base,
            metadata,
            main_py,
            license,
        })
    }

    /// Assemble the flashable image, compiling `main.py` when the schema embeds it.
    pub async fn build<C: ScriptCompiler>(
        &self,
        compiler: &C,
        hub_name: Option<&str>,
    ) -> Result<FirmwareImage, FirmwareError> {
        let mpy = match (&self.main_py, self.metadata.mpy_abi_version()) {
            (Some(source), Some(abi)) => Some(
                compiler
                    .compile(source, abi, self.metadata.mpy_cross_options())
                    .await?,
            ),
            _ => None,
        };
        let mut builder = FirmwareBuilder::new(&self.base, &self.metadata);
        if let Some(mpy) = &mpy {
            builder = builder.script(mpy);
        }
        if let Some(name) = hub_name {
            builder = builder.hub_name(name);
        }
        builder.build()
    }
}

fn read_entry<R: Read + Seek>(
    zip: &mut zip::ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>, FirmwareError> {
    let mut entry = match zip.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut data = Vec::new();
    entry.read_to_end(&mut data)?;
    Ok(Some(data))
}
