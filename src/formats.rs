//! Built-in archive format table.
//!
//! Every handler shipped in `7z.dll` / `7z.so` is identified by a class id of
//! the shape `23170F69-40C1-278A-1000-000110xx0000`.  The table below freezes
//! those ids together with well-known signatures and extensions, so a caller
//! can name a format without first querying a loaded module and the detector
//! can run before any engine is present.
//!
//! A loaded engine reports its own, authoritative descriptors (see
//! [`crate::catalog`]); this table is the fallback and the test fixture.

use uuid::Uuid;

// ── Class ids ───────────────────────────────────────────────────────────────

const CLASS_ID_BASE: u128 = 0x23170F69_40C1_278A_1000_000110000000;

#[inline]
const fn class_id(tag: u8) -> Uuid {
    Uuid::from_u128(CLASS_ID_BASE | ((tag as u128) << 16))
}

// ── ArchiveFormat ───────────────────────────────────────────────────────────

/// Formats known to the stock engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    SevenZip, Arj, BZip2, Cab, Chm, Compound, Cpio, Deb, GZip, Iso,
    Lzh, Lzma, Nsis, Rar, Rar5, Rpm, Split, Tar, Wim, Lzw,
    Zip, Udf, Xar, Mub, Hfs, Dmg, Xz, Mslz, Pe, Elf,
    Swf, Vhd, Flv, SquashFs, Lzma86, Ppmd, Te, UefiC, UefiS, CramFs,
    Apm, Swfc, Ntfs, Fat, Mbr, MachO,
}

struct Row {
    tag:        u8,
    name:       &'static str,
    extensions: &'static str,
    offset:     u64,
    signatures: &'static [&'static [u8]],
}

const fn row(
    tag: u8,
    name: &'static str,
    extensions: &'static str,
    offset: u64,
    signatures: &'static [&'static [u8]],
) -> Row {
    Row { tag, name, extensions, offset, signatures }
}

// Indexed by `ArchiveFormat as usize`; keep in enum order.
const TABLE: [Row; 46] = [
    row(0x07, "7z",       "7z",                          0,      &[b"7z\xBC\xAF\x27\x1C"]),
    row(0x04, "Arj",      "arj",                         0,      &[b"\x60\xEA"]),
    row(0x02, "bzip2",    "bz2 bzip2 tbz2 tbz",          0,      &[b"BZh"]),
    row(0x08, "Cab",      "cab",                         0,      &[b"MSCF"]),
    row(0xE9, "Chm",      "chm chi chq chw",             0,      &[b"ITSF"]),
    row(0xE5, "Compound", "msi msp doc xls ppt",         0,      &[b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1"]),
    row(0xED, "Cpio",     "cpio",                        0,      &[b"070701", b"070702", b"070707"]),
    row(0xEC, "Ar",       "ar a deb lib",                0,      &[b"!<arch>"]),
    row(0xEF, "gzip",     "gz gzip tgz tpz",             0,      &[b"\x1F\x8B"]),
    row(0xE7, "Iso",      "iso img",                     0x8001, &[b"CD001"]),
    row(0x06, "Lzh",      "lzh lha",                     2,      &[b"-lh"]),
    row(0x0A, "lzma",     "lzma",                        0,      &[]),
    row(0x09, "Nsis",     "nsis",                        0,      &[]),
    row(0x03, "Rar",      "rar r00",                     0,      &[b"Rar!\x1A\x07\x00"]),
    row(0xCC, "Rar5",     "rar r00",                     0,      &[b"Rar!\x1A\x07\x01\x00"]),
    row(0xEB, "Rpm",      "rpm",                         0,      &[b"\xED\xAB\xEE\xDB"]),
    row(0xEA, "Split",    "001",                         0,      &[]),
    row(0xEE, "tar",      "tar ova",                     257,    &[b"ustar"]),
    row(0xE6, "wim",      "wim swm esd",                 0,      &[b"MSWIM\x00\x00\x00"]),
    row(0x05, "Z",        "z taz",                       0,      &[b"\x1F\x9D"]),
    row(0x01, "zip",      "zip z01 zipx jar xpi odt ods docx xlsx epub", 0, &[b"PK\x03\x04", b"PK\x05\x06"]),
    row(0xE0, "Udf",      "udf iso img",                 0,      &[]),
    row(0xE1, "Xar",      "xar pkg",                     0,      &[b"xar!"]),
    row(0xE2, "Mub",      "mub",                         0,      &[b"\xCA\xFE\xBA\xBE", b"\xB9\xFA\xF1\x0E"]),
    row(0xE3, "HFS",      "hfs hfsx",                    1024,   &[b"H+", b"HX"]),
    row(0xE4, "Dmg",      "dmg",                         0,      &[b"\x78\x01\x73\x0D\x62\x62\x60"]),
    row(0x0C, "xz",       "xz txz",                      0,      &[b"\xFD7zXZ\x00"]),
    row(0xD5, "MsLZ",     "mslz",                        0,      &[b"SZDD"]),
    row(0xDD, "PE",       "exe dll sys",                 0,      &[b"MZ"]),
    row(0xDE, "ELF",      "elf",                         0,      &[b"\x7FELF"]),
    row(0xD7, "SWF",      "swf",                         0,      &[b"FWS"]),
    row(0xDC, "VHD",      "vhd",                         0,      &[b"conectix"]),
    row(0xD6, "FLV",      "flv",                         0,      &[b"FLV"]),
    row(0xD2, "SquashFS", "squashfs",                    0,      &[b"hsqs", b"sqsh"]),
    row(0x0B, "lzma86",   "lzma86",                      0,      &[]),
    row(0x0D, "Ppmd",     "pmd",                         0,      &[b"\x8F\xAF\xAC\x84"]),
    row(0xCF, "TE",       "te",                          0,      &[b"VZ"]),
    row(0xD0, "UEFIc",    "scap",                        0,      &[]),
    row(0xD1, "UEFIf",    "uefif",                       0,      &[]),
    row(0xD3, "CramFS",   "cramfs",                      0,      &[b"\x45\x3D\xCD\x28"]),
    row(0xD4, "APM",      "apm",                         0,      &[b"ER"]),
    row(0xD8, "SWFc",     "swf",                         0,      &[b"CWS", b"ZWS"]),
    row(0xD9, "NTFS",     "ntfs img",                    3,      &[b"NTFS    "]),
    row(0xDA, "FAT",      "fat img",                     0,      &[]),
    row(0xDB, "MBR",      "mbr",                         0,      &[]),
    row(0xDF, "MachO",    "macho",                       0,      &[b"\xCE\xFA\xED\xFE", b"\xCF\xFA\xED\xFE", b"\xFE\xED\xFA\xCE", b"\xFE\xED\xFA\xCF"]),
];

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 46] = [
        ArchiveFormat::SevenZip, ArchiveFormat::Arj, ArchiveFormat::BZip2, ArchiveFormat::Cab,
        ArchiveFormat::Chm, ArchiveFormat::Compound, ArchiveFormat::Cpio, ArchiveFormat::Deb,
        ArchiveFormat::GZip, ArchiveFormat::Iso, ArchiveFormat::Lzh, ArchiveFormat::Lzma,
        ArchiveFormat::Nsis, ArchiveFormat::Rar, ArchiveFormat::Rar5, ArchiveFormat::Rpm,
        ArchiveFormat::Split, ArchiveFormat::Tar, ArchiveFormat::Wim, ArchiveFormat::Lzw,
        ArchiveFormat::Zip, ArchiveFormat::Udf, ArchiveFormat::Xar, ArchiveFormat::Mub,
        ArchiveFormat::Hfs, ArchiveFormat::Dmg, ArchiveFormat::Xz, ArchiveFormat::Mslz,
        ArchiveFormat::Pe, ArchiveFormat::Elf, ArchiveFormat::Swf, ArchiveFormat::Vhd,
        ArchiveFormat::Flv, ArchiveFormat::SquashFs, ArchiveFormat::Lzma86, ArchiveFormat::Ppmd,
        ArchiveFormat::Te, ArchiveFormat::UefiC, ArchiveFormat::UefiS, ArchiveFormat::CramFs,
        ArchiveFormat::Apm, ArchiveFormat::Swfc, ArchiveFormat::Ntfs, ArchiveFormat::Fat,
        ArchiveFormat::Mbr, ArchiveFormat::MachO,
    ];

    #[inline]
    fn row(self) -> &'static Row {
        &TABLE[self as usize]
    }

    /// The handler's class id, as passed to `CreateObject`.
    pub fn class_id(self) -> Uuid {
        class_id(self.row().tag)
    }

    pub fn from_class_id(id: &Uuid) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.class_id() == *id)
    }

    /// Handler name as the engine reports it (`kName`).
    pub fn name(self) -> &'static str {
        self.row().name
    }

    /// Case-insensitive lookup by handler name or variant name (`Ar` and
    /// `Deb` both resolve).
    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| {
            f.name().eq_ignore_ascii_case(s) || format!("{f:?}").eq_ignore_ascii_case(s)
        })
    }

    /// Extensions the handler claims, most specific first.
    pub fn extensions(self) -> impl Iterator<Item = &'static str> {
        self.row().extensions.split(' ')
    }

    pub fn signatures(self) -> &'static [&'static [u8]] {
        self.row().signatures
    }

    pub fn signature_offset(self) -> u64 {
        self.row().offset
    }

    /// Guess a format from a bare extension (no leading dot).
    ///
    /// `rar` is deliberately unresolved: RAR4 and RAR5 share it and only the
    /// signature tells them apart.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        Some(match ext.as_str() {
            "7z"          => ArchiveFormat::SevenZip,
            "gz"          => ArchiveFormat::GZip,
            "tar"         => ArchiveFormat::Tar,
            "zip"         => ArchiveFormat::Zip,
            "lzma"        => ArchiveFormat::Lzma,
            "lzh"         => ArchiveFormat::Lzh,
            "arj"         => ArchiveFormat::Arj,
            "bz2"         => ArchiveFormat::BZip2,
            "cab"         => ArchiveFormat::Cab,
            "chm"         => ArchiveFormat::Chm,
            "deb"         => ArchiveFormat::Deb,
            "iso"         => ArchiveFormat::Iso,
            "rpm"         => ArchiveFormat::Rpm,
            "wim"         => ArchiveFormat::Wim,
            "udf"         => ArchiveFormat::Udf,
            "mub"         => ArchiveFormat::Mub,
            "xar"         => ArchiveFormat::Xar,
            "hfs"         => ArchiveFormat::Hfs,
            "dmg"         => ArchiveFormat::Dmg,
            "z"           => ArchiveFormat::Lzw,
            "xz"          => ArchiveFormat::Xz,
            "flv"         => ArchiveFormat::Flv,
            "swf"         => ArchiveFormat::Swf,
            "exe" | "dll" => ArchiveFormat::Pe,
            "vhd"         => ArchiveFormat::Vhd,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
