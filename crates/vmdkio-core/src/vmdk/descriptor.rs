//! VMDK descriptor file parsing.
//!
//! A descriptor is line oriented text: a header of `key = value` pairs, an
//! `# Extent description` section with one record per extent, and an optional
//! disk database of `ddb.*` keys. Parsing is a pure function over the leading text
//! region of the file; opening backing files is left to the resolver.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::SECTOR_SIZE;
use crate::error::{Error, Result};

/// First line of every descriptor file.
pub const DESCRIPTOR_SIGNATURE: &str = "# Disk DescriptorFile";

const EXTENT_SECTION: &str = "# extent description";
const CHANGE_TRACKING_SECTION: &str = "# change tracking file";
const DISK_DATABASE_SECTION: &str = "# the disk data base";

/// Parent content id value meaning "no parent".
pub const NO_PARENT_CID: u32 = 0xffff_ffff;

/// Access mode of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentAccess {
    /// `RW`
    ReadWrite,
    /// `RDONLY`
    ReadOnly,
    /// `NOACCESS`
    NoAccess,
}

impl ExtentAccess {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RW" => Some(ExtentAccess::ReadWrite),
            "RDONLY" => Some(ExtentAccess::ReadOnly),
            "NOACCESS" => Some(ExtentAccess::NoAccess),
            _ => None,
        }
    }
}

impl fmt::Display for ExtentAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtentAccess::ReadWrite => write!(f, "RW"),
            ExtentAccess::ReadOnly => write!(f, "RDONLY"),
            ExtentAccess::NoAccess => write!(f, "NOACCESS"),
        }
    }
}

/// The type of a VMDK extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentType {
    /// Flat extent - raw disk data in a separate file.
    Flat,
    /// Sparse extent - hosted sparse file with grain tables.
    Sparse,
    /// Zero extent - reads as zeros, no backing file.
    Zero,
    /// VMFS flat extent.
    Vmfs,
    /// VMFS sparse (COWD) extent.
    VmfsSparse,
    /// VMFS raw device mapping.
    VmfsRdm,
    /// VMFS raw device.
    VmfsRaw,
    /// VMFS thin provisioned extent, stored like VMFS sparse.
    VmfsThin,
}

impl FromStr for ExtentType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FLAT" => Ok(ExtentType::Flat),
            "SPARSE" => Ok(ExtentType::Sparse),
            "ZERO" => Ok(ExtentType::Zero),
            "VMFS" => Ok(ExtentType::Vmfs),
            "VMFSSPARSE" => Ok(ExtentType::VmfsSparse),
            "VMFSRDM" => Ok(ExtentType::VmfsRdm),
            "VMFSRAW" => Ok(ExtentType::VmfsRaw),
            "VMFSTHIN" => Ok(ExtentType::VmfsThin),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ExtentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExtentType::Flat => "FLAT",
            ExtentType::Sparse => "SPARSE",
            ExtentType::Zero => "ZERO",
            ExtentType::Vmfs => "VMFS",
            ExtentType::VmfsSparse => "VMFSSPARSE",
            ExtentType::VmfsRdm => "VMFSRDM",
            ExtentType::VmfsRaw => "VMFSRAW",
            ExtentType::VmfsThin => "VMFSTHIN",
        };
        f.write_str(name)
    }
}

/// The `createType` of a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskType {
    MonolithicSparse,
    MonolithicFlat,
    TwoGbMaxExtentSparse,
    TwoGbMaxExtentFlat,
    StreamOptimized,
    Custom,
    FullDevice,
    PartitionedDevice,
    Vmfs,
    VmfsSparse,
    VmfsThin,
    VmfsPreallocated,
    VmfsEagerZeroedThick,
    VmfsRaw,
    VmfsRdm,
    VmfsRdmp,
    /// Any value not listed above, kept verbatim.
    Other(String),
}

impl DiskType {
    /// Parse a `createType` value. Matching is case-insensitive and never fails.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "monolithicsparse" => DiskType::MonolithicSparse,
            "monolithicflat" => DiskType::MonolithicFlat,
            "2gbmaxextentsparse" | "twogbmaxextentsparse" => DiskType::TwoGbMaxExtentSparse,
            "2gbmaxextentflat" | "twogbmaxextentflat" => DiskType::TwoGbMaxExtentFlat,
            "streamoptimized" => DiskType::StreamOptimized,
            "custom" => DiskType::Custom,
            "fulldevice" => DiskType::FullDevice,
            "partitioneddevice" => DiskType::PartitionedDevice,
            "vmfs" => DiskType::Vmfs,
            "vmfssparse" => DiskType::VmfsSparse,
            "vmfsthin" => DiskType::VmfsThin,
            "vmfspreallocated" => DiskType::VmfsPreallocated,
            "vmfseagerzeroedthick" => DiskType::VmfsEagerZeroedThick,
            "vmfsraw" => DiskType::VmfsRaw,
            "vmfsrdm" => DiskType::VmfsRdm,
            "vmfsrdmp" => DiskType::VmfsRdmp,
            _ => DiskType::Other(s.to_string()),
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiskType::MonolithicSparse => "monolithicSparse",
            DiskType::MonolithicFlat => "monolithicFlat",
            DiskType::TwoGbMaxExtentSparse => "twoGbMaxExtentSparse",
            DiskType::TwoGbMaxExtentFlat => "twoGbMaxExtentFlat",
            DiskType::StreamOptimized => "streamOptimized",
            DiskType::Custom => "custom",
            DiskType::FullDevice => "fullDevice",
            DiskType::PartitionedDevice => "partitionedDevice",
            DiskType::Vmfs => "vmfs",
            DiskType::VmfsSparse => "vmfsSparse",
            DiskType::VmfsThin => "vmfsThin",
            DiskType::VmfsPreallocated => "vmfsPreallocated",
            DiskType::VmfsEagerZeroedThick => "vmfsEagerZeroedThick",
            DiskType::VmfsRaw => "vmfsRaw",
            DiskType::VmfsRdm => "vmfsRDM",
            DiskType::VmfsRdmp => "vmfsRDMP",
            DiskType::Other(s) => s.as_str(),
        };
        f.write_str(name)
    }
}

/// Disk adapter type from `ddb.adapterType`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterType {
    Ide,
    BusLogic,
    LsiLogic,
    LsiLogicSas,
    LegacyEsx,
    PvScsi,
    Other(String),
}

impl AdapterType {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "ide" => AdapterType::Ide,
            "buslogic" => AdapterType::BusLogic,
            "lsilogic" => AdapterType::LsiLogic,
            "lsisas1068" | "lsilogicsas" => AdapterType::LsiLogicSas,
            "legacyesx" => AdapterType::LegacyEsx,
            "pvscsi" => AdapterType::PvScsi,
            _ => AdapterType::Other(s.to_string()),
        }
    }

    /// True for the SCSI family of adapters.
    pub fn is_scsi(&self) -> bool {
        matches!(
            self,
            AdapterType::BusLogic
                | AdapterType::LsiLogic
                | AdapterType::LsiLogicSas
                | AdapterType::LegacyEsx
                | AdapterType::PvScsi
        )
    }
}

impl fmt::Display for AdapterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterType::Ide => "ide",
            AdapterType::BusLogic => "buslogic",
            AdapterType::LsiLogic => "lsilogic",
            AdapterType::LsiLogicSas => "lsisas1068",
            AdapterType::LegacyEsx => "legacyESX",
            AdapterType::PvScsi => "pvscsi",
            AdapterType::Other(s) => s.as_str(),
        };
        f.write_str(name)
    }
}

/// Cylinders/heads/sectors geometry from the disk database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u64,
    pub heads: u32,
    pub sectors: u32,
}

impl DiskGeometry {
    /// Number of sectors addressable through the geometry.
    pub fn total_sectors(&self) -> u64 {
        self.cylinders * self.heads as u64 * self.sectors as u64
    }
}

/// A VMDK extent entry describing a contiguous range of the composed disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentSpec {
    /// Access mode of the extent.
    pub access: ExtentAccess,
    /// Size of this extent in 512-byte sectors.
    pub size_sectors: u64,
    /// Type of the extent.
    pub extent_type: ExtentType,
    /// Backing file name, relative to the descriptor or absolute. `None` for ZERO extents.
    pub filename: Option<String>,
    /// Offset within the backing file, in sectors.
    pub file_offset: u64,
    /// First sector of this extent in the composed disk.
    pub start_sector: u64,
}

/// Conversions saturate; parsed extents always fit.
impl ExtentSpec {
    /// Byte offset of the extent in the composed disk.
    pub fn start_offset(&self) -> u64 {
        self.start_sector.saturating_mul(SECTOR_SIZE)
    }

    /// Size of the extent in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_sectors.saturating_mul(SECTOR_SIZE)
    }

    /// One past the last sector of this extent in the composed disk.
    pub fn end_sector(&self) -> u64 {
        self.start_sector.saturating_add(self.size_sectors)
    }
}

/// Parsed VMDK descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskManifest {
    /// Descriptor format version.
    pub version: u32,
    /// Content ID.
    pub cid: u32,
    /// Parent content ID; [`NO_PARENT_CID`] when the disk has no parent.
    pub parent_cid: u32,
    /// The type of VMDK.
    pub create_type: DiskType,
    /// Character encoding declared by the descriptor.
    pub encoding: Option<String>,
    /// Parent file name hint of a delta disk.
    pub parent_file_name_hint: Option<String>,
    /// Extents in composed-disk order.
    pub extents: Vec<ExtentSpec>,
    /// Path of the change tracking file.
    pub change_track_path: Option<String>,
    /// Disk geometry, when all three values are present.
    pub geometry: Option<DiskGeometry>,
    /// Disk adapter type.
    pub adapter_type: Option<AdapterType>,
    /// Virtual hardware version.
    pub hw_version: Option<String>,
    /// Disk UUID.
    pub uuid: Option<String>,
}

impl DiskManifest {
    /// Total disk size in sectors.
    pub fn total_sectors(&self) -> u64 {
        self.extents
            .iter()
            .fold(0u64, |total, e| total.saturating_add(e.size_sectors))
    }

    /// Total disk size in bytes.
    pub fn media_size(&self) -> u64 {
        self.total_sectors().saturating_mul(SECTOR_SIZE)
    }

    /// True when the disk is a delta on top of a parent image.
    pub fn has_parent(&self) -> bool {
        self.parent_cid != NO_PARENT_CID
    }

    /// A manifest for a sparse file that carries no embedded descriptor.
    pub fn single_sparse(filename: impl Into<String>, capacity_sectors: u64) -> Self {
        Self {
            version: 1,
            cid: 0,
            parent_cid: NO_PARENT_CID,
            create_type: DiskType::MonolithicSparse,
            encoding: None,
            parent_file_name_hint: None,
            extents: vec![ExtentSpec {
                access: ExtentAccess::ReadOnly,
                size_sectors: capacity_sectors,
                extent_type: ExtentType::Sparse,
                filename: Some(filename.into()),
                file_offset: 0,
                start_sector: 0,
            }],
            change_track_path: None,
            geometry: None,
            adapter_type: None,
            hw_version: None,
            uuid: None,
        }
    }
}

impl FromStr for DiskManifest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_descriptor(s.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Extents,
    ChangeTracking,
    DiskDatabase,
}

/// Parse a VMDK descriptor from the leading bytes of a descriptor file.
///
/// Bytes after the first NUL are ignored, so the descriptor region embedded in a
/// sparse extent can be handed over as-is.
///
/// # Errors
///
/// Returns [`Error::MalformedHeader`], [`Error::MalformedExtent`] or
/// [`Error::UnknownExtentType`] on syntax errors. Missing backing files are not
/// detected here.
pub fn parse_descriptor(bytes: &[u8]) -> Result<DiskManifest> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let content = std::str::from_utf8(&bytes[..end])
        .map_err(|e| Error::malformed_header(format!("descriptor is not valid UTF-8: {}", e)))?;

    let mut section = Section::Header;
    // Lower-cased key -> (value, line number)
    let mut values: HashMap<String, (String, usize)> = HashMap::new();
    let mut extents = Vec::new();
    let mut next_start = 0u64;

    for (index, raw_line) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();

        if line.is_empty() {
            continue;
        }

        if line.starts_with('#') {
            section = match line.to_ascii_lowercase().as_str() {
                s if s == DESCRIPTOR_SIGNATURE.to_ascii_lowercase() => Section::Header,
                EXTENT_SECTION => Section::Extents,
                CHANGE_TRACKING_SECTION => Section::ChangeTracking,
                DISK_DATABASE_SECTION => Section::DiskDatabase,
                _ => section,
            };
            continue;
        }

        let first_token = line.split_whitespace().next().unwrap_or_default();
        if ExtentAccess::parse(first_token).is_some() {
            let mut extent = parse_extent_line(line, line_no)?;
            extent.start_sector = next_start;
            next_start = next_start
                .checked_add(extent.size_sectors)
                .filter(|end| end.checked_mul(SECTOR_SIZE).is_some())
                .ok_or_else(|| Error::malformed_extent(line_no, "disk size overflows"))?;
            let file_end = extent
                .file_offset
                .checked_add(extent.size_sectors)
                .and_then(|end| end.checked_mul(SECTOR_SIZE));
            if file_end.is_none() {
                return Err(Error::malformed_extent(
                    line_no,
                    "extent file offset plus size overflows",
                ));
            }
            extents.push(extent);
            continue;
        }

        if section == Section::Extents && !line.contains('=') {
            return Err(Error::malformed_extent(
                line_no,
                format!("unknown access mode '{}'", first_token),
            ));
        }

        let (key, value) = parse_key_value(line)
            .ok_or_else(|| Error::malformed_header_at(line_no, format!("expected 'key = value', got: {}", line)))?;
        values.insert(key.to_ascii_lowercase(), (value, line_no));
    }

    let version: u32 = match values.get("version") {
        Some((v, line)) => v
            .parse()
            .map_err(|_| Error::malformed_header_at(*line, format!("invalid version: {}", v)))?,
        None => return Err(Error::malformed_header("version not found in header")),
    };
    let cid = match values.get("cid") {
        Some((v, line)) => parse_cid(v, *line, "CID")?,
        None => return Err(Error::malformed_header("CID not found in header")),
    };
    let parent_cid = match values.get("parentcid") {
        Some((v, line)) => parse_cid(v, *line, "parentCID")?,
        None => NO_PARENT_CID,
    };
    let create_type = values
        .get("createtype")
        .map(|(v, _)| DiskType::parse(v))
        .unwrap_or(DiskType::Custom);

    let get = |key: &str| values.get(key).map(|(v, _)| v.clone());
    let geometry = parse_geometry(&values)?;

    log::debug!(
        "Parsed descriptor: version {}, createType {}, {} extent(s)",
        version,
        create_type,
        extents.len()
    );

    Ok(DiskManifest {
        version,
        cid,
        parent_cid,
        create_type,
        encoding: get("encoding"),
        parent_file_name_hint: get("parentfilenamehint"),
        extents,
        change_track_path: get("changetrackpath"),
        geometry,
        adapter_type: get("ddb.adaptertype").map(|v| AdapterType::parse(&v)),
        hw_version: get("ddb.virtualhwversion"),
        uuid: get("ddb.uuid"),
    })
}

fn parse_cid(value: &str, line: usize, name: &str) -> Result<u32> {
    u32::from_str_radix(value, 16)
        .map_err(|_| Error::malformed_header_at(line, format!("invalid {}: {}", name, value)))
}

fn parse_geometry(values: &HashMap<String, (String, usize)>) -> Result<Option<DiskGeometry>> {
    fn number<T: FromStr>(
        values: &HashMap<String, (String, usize)>,
        key: &str,
    ) -> Result<Option<T>> {
        match values.get(key) {
            Some((v, line)) => v
                .parse()
                .map(Some)
                .map_err(|_| Error::malformed_header_at(*line, format!("invalid {}: {}", key, v))),
            None => Ok(None),
        }
    }

    let cylinders = number::<u64>(values, "ddb.geometry.cylinders")?;
    let heads = number::<u32>(values, "ddb.geometry.heads")?;
    let sectors = number::<u32>(values, "ddb.geometry.sectors")?;
    Ok(match (cylinders, heads, sectors) {
        (Some(cylinders), Some(heads), Some(sectors)) => Some(DiskGeometry {
            cylinders,
            heads,
            sectors,
        }),
        _ => None,
    })
}

/// Parse a key=value or key = value line.
///
/// Returns None if the line doesn't contain an equals sign.
fn parse_key_value(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    if key.is_empty() {
        return None;
    }
    let mut value = line[eq_pos + 1..].trim().to_string();

    // Remove surrounding quotes if present
    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        value = value[1..value.len() - 1].to_string();
    }

    Some((key, value))
}

#[derive(Debug, PartialEq, Eq)]
enum Column<'a> {
    Word(&'a str),
    Quoted(&'a str),
}

impl<'a> Column<'a> {
    fn text(&self) -> &'a str {
        match self {
            Column::Word(s) | Column::Quoted(s) => s,
        }
    }
}

/// Split an extent record into columns; quoted columns may contain whitespace.
fn split_columns(line: &str, line_no: usize) -> Result<Vec<Column<'_>>> {
    let mut columns = Vec::new();
    let mut rest = line.trim_start();
    while !rest.is_empty() {
        if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted
                .find('"')
                .ok_or_else(|| Error::malformed_extent(line_no, "unclosed quote in file name"))?;
            columns.push(Column::Quoted(&quoted[..end]));
            rest = quoted[end + 1..].trim_start();
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            columns.push(Column::Word(&rest[..end]));
            rest = rest[end..].trim_start();
        }
    }
    Ok(columns)
}

/// Parse an extent line like: `RW 838860800 FLAT "TestVM-flat.vmdk" 0`
fn parse_extent_line(line: &str, line_no: usize) -> Result<ExtentSpec> {
    // Extent format: ACCESS SIZE TYPE ["FILENAME" [OFFSET [...]]]
    let columns = split_columns(line, line_no)?;
    if columns.len() < 3 {
        return Err(Error::malformed_extent(
            line_no,
            format!("expected at least 3 columns, got {}", columns.len()),
        ));
    }

    let access = ExtentAccess::parse(columns[0].text()).ok_or_else(|| {
        Error::malformed_extent(line_no, format!("unknown access mode '{}'", columns[0].text()))
    })?;
    let size_sectors: u64 = columns[1].text().parse().map_err(|_| {
        Error::malformed_extent(line_no, format!("invalid extent size: {}", columns[1].text()))
    })?;
    if size_sectors == 0 {
        return Err(Error::malformed_extent(line_no, "extent size must be positive"));
    }
    let extent_type: ExtentType =
        columns[2]
            .text()
            .parse()
            .map_err(|_| Error::UnknownExtentType {
                line: line_no,
                value: columns[2].text().to_string(),
            })?;

    let filename = columns
        .get(3)
        .map(|c| c.text().to_string())
        .filter(|name| !name.is_empty());
    let file_offset = match columns.get(4) {
        Some(Column::Word(offset)) => offset.parse().map_err(|_| {
            Error::malformed_extent(line_no, format!("invalid extent offset: {}", offset))
        })?,
        Some(Column::Quoted(offset)) => {
            return Err(Error::malformed_extent(
                line_no,
                format!("extent offset must not be quoted: \"{}\"", offset),
            ))
        }
        None => 0,
    };

    Ok(ExtentSpec {
        access,
        size_sectors,
        extent_type,
        filename,
        file_offset,
        start_sector: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_type_from_str() {
        assert_eq!("FLAT".parse(), Ok(ExtentType::Flat));
        assert_eq!("flat".parse(), Ok(ExtentType::Flat));
        assert_eq!("SPARSE".parse(), Ok(ExtentType::Sparse));
        assert_eq!("ZERO".parse(), Ok(ExtentType::Zero));
        assert_eq!("VMFS".parse(), Ok(ExtentType::Vmfs));
        assert_eq!("VMFSSPARSE".parse(), Ok(ExtentType::VmfsSparse));
        assert_eq!("VMFSRDM".parse(), Ok(ExtentType::VmfsRdm));
        assert_eq!("VMFSRAW".parse(), Ok(ExtentType::VmfsRaw));
        assert_eq!("vmfsThin".parse(), Ok(ExtentType::VmfsThin));
        assert_eq!("UNKNOWN".parse::<ExtentType>(), Err(()));
    }

    #[test]
    fn test_parse_key_value_no_spaces() {
        let (key, value) = parse_key_value("version=1").unwrap();
        assert_eq!(key, "version");
        assert_eq!(value, "1");
    }

    #[test]
    fn test_parse_key_value_quoted() {
        let (key, value) = parse_key_value("ddb.geometry.cylinders = \"52216\"").unwrap();
        assert_eq!(key, "ddb.geometry.cylinders");
        assert_eq!(value, "52216");
        assert!(parse_key_value("= value").is_none());
        assert!(parse_key_value("no separator").is_none());
    }

    #[test]
    fn test_split_columns_quoted_with_spaces() {
        let columns = split_columns("RW 128 FLAT \"my disk file.vmdk\" 64", 1).unwrap();
        assert_eq!(
            columns,
            vec![
                Column::Word("RW"),
                Column::Word("128"),
                Column::Word("FLAT"),
                Column::Quoted("my disk file.vmdk"),
                Column::Word("64"),
            ]
        );
    }

    #[test]
    fn test_split_columns_unclosed_quote() {
        let err = split_columns("RW 128 FLAT \"broken.vmdk 0", 7).unwrap_err();
        assert!(matches!(err, Error::MalformedExtent { line: 7, .. }));
    }

    #[test]
    fn test_parse_extent_line() {
        let extent = parse_extent_line("RW 838860800 FLAT \"TestVM-flat.vmdk\" 0", 1).unwrap();
        assert_eq!(extent.access, ExtentAccess::ReadWrite);
        assert_eq!(extent.size_sectors, 838860800);
        assert_eq!(extent.extent_type, ExtentType::Flat);
        assert_eq!(extent.filename.as_deref(), Some("TestVM-flat.vmdk"));
        assert_eq!(extent.file_offset, 0);
    }

    #[test]
    fn test_parse_extent_line_zero_without_file() {
        let extent = parse_extent_line("RDONLY 4096 ZERO", 1).unwrap();
        assert_eq!(extent.access, ExtentAccess::ReadOnly);
        assert_eq!(extent.extent_type, ExtentType::Zero);
        assert_eq!(extent.filename, None);
    }

    #[test]
    fn test_parse_extent_line_rejects_zero_size() {
        let err = parse_extent_line("RW 0 FLAT \"a.vmdk\" 0", 4).unwrap_err();
        assert!(matches!(err, Error::MalformedExtent { line: 4, .. }));
    }

    #[test]
    fn test_parse_extent_line_unknown_type() {
        let err = parse_extent_line("RW 10 BOGUS \"a.vmdk\"", 9).unwrap_err();
        match err {
            Error::UnknownExtentType { line, value } => {
                assert_eq!(line, 9);
                assert_eq!(value, "BOGUS");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_disk_type_aliases() {
        assert_eq!(DiskType::parse("2GbMaxExtentSparse"), DiskType::TwoGbMaxExtentSparse);
        assert_eq!(DiskType::parse("twoGbMaxExtentSparse"), DiskType::TwoGbMaxExtentSparse);
        assert_eq!(DiskType::parse("streamOptimized").to_string(), "streamOptimized");
        assert_eq!(
            DiskType::parse("somethingNew"),
            DiskType::Other("somethingNew".to_string())
        );
    }

    #[test]
    fn test_adapter_type() {
        assert_eq!(AdapterType::parse("lsilogic"), AdapterType::LsiLogic);
        assert!(AdapterType::parse("buslogic").is_scsi());
        assert!(!AdapterType::parse("ide").is_scsi());
    }

    #[test]
    fn test_single_sparse_manifest() {
        let manifest = DiskManifest::single_sparse("disk.vmdk", 2048);
        assert_eq!(manifest.media_size(), 2048 * 512);
        assert!(!manifest.has_parent());
        assert_eq!(manifest.extents[0].extent_type, ExtentType::Sparse);
    }

    #[test]
    fn test_disk_size_calculations() {
        let manifest: DiskManifest = "version=1\nCID=1\nRW 1000 FLAT \"a.vmdk\" 0\nRW 2000 FLAT \"b.vmdk\" 0\n"
            .parse()
            .unwrap();
        assert_eq!(manifest.total_sectors(), 3000);
        assert_eq!(manifest.media_size(), 3000 * 512);
        assert_eq!(manifest.extents[1].start_sector, 1000);
        assert_eq!(manifest.extents[1].start_offset(), 1000 * 512);
        assert_eq!(manifest.extents[1].end_sector(), 3000);
    }
}
