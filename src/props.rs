//! Property ids understood by the engine.

/// Per-item property ids (`kpid*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ItemProp {
    Path            = 3,
    Name            = 4,
    Extension       = 5,
    IsFolder        = 6,
    Size            = 7,
    PackedSize      = 8,
    Attributes      = 9,
    CreationTime    = 10,
    LastAccessTime  = 11,
    LastWriteTime   = 12,
    Solid           = 13,
    Commented       = 14,
    Encrypted       = 15,
    SplitBefore     = 16,
    SplitAfter      = 17,
    DictionarySize  = 18,
    Crc             = 19,
    Type            = 20,
    IsAnti          = 21,
    Method          = 22,
    HostOs          = 23,
    FileSystem      = 24,
    User            = 25,
    Group           = 26,
    Block           = 27,
    Comment         = 28,
}

impl ItemProp {
    #[inline]
    pub fn id(self) -> u32 { self as u32 }

    /// Name used in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            ItemProp::Path           => "Path",
            ItemProp::Name           => "Name",
            ItemProp::Extension      => "Extension",
            ItemProp::IsFolder       => "IsFolder",
            ItemProp::Size           => "Size",
            ItemProp::PackedSize     => "PackedSize",
            ItemProp::Attributes     => "Attributes",
            ItemProp::CreationTime   => "CTime",
            ItemProp::LastAccessTime => "ATime",
            ItemProp::LastWriteTime  => "MTime",
            ItemProp::Solid          => "Solid",
            ItemProp::Commented      => "Commented",
            ItemProp::Encrypted      => "Encrypted",
            ItemProp::SplitBefore    => "SplitBefore",
            ItemProp::SplitAfter     => "SplitAfter",
            ItemProp::DictionarySize => "DictionarySize",
            ItemProp::Crc            => "CRC",
            ItemProp::Type           => "Type",
            ItemProp::IsAnti         => "IsAnti",
            ItemProp::Method         => "Method",
            ItemProp::HostOs         => "HostOS",
            ItemProp::FileSystem     => "FileSystem",
            ItemProp::User           => "User",
            ItemProp::Group          => "Group",
            ItemProp::Block          => "Block",
            ItemProp::Comment        => "Comment",
        }
    }
}

/// Format handler property ids (`NArchive::NHandlerPropID`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HandlerProp {
    Name            = 0,
    ClassId         = 1,
    Extension       = 2,
    AddExtension    = 3,
    Update          = 4,
    KeepName        = 5,
    Signature       = 6,
    MultiSignature  = 7,
    SignatureOffset = 8,
    AltStreams      = 9,
    NtSecure        = 10,
    Flags           = 11,
    TimeFlags       = 12,
}

impl HandlerProp {
    #[inline]
    pub fn id(self) -> u32 { self as u32 }

    pub fn name(self) -> &'static str {
        match self {
            HandlerProp::Name            => "Name",
            HandlerProp::ClassId         => "ClassID",
            HandlerProp::Extension       => "Extension",
            HandlerProp::AddExtension    => "AddExtension",
            HandlerProp::Update          => "Update",
            HandlerProp::KeepName        => "KeepName",
            HandlerProp::Signature       => "Signature",
            HandlerProp::MultiSignature  => "MultiSignature",
            HandlerProp::SignatureOffset => "SignatureOffset",
            HandlerProp::AltStreams      => "AltStreams",
            HandlerProp::NtSecure        => "NtSecure",
            HandlerProp::Flags           => "Flags",
            HandlerProp::TimeFlags       => "TimeFlags",
        }
    }

    /// Properties whose `BSTR` payload is raw bytes rather than text.
    pub fn is_binary(self) -> bool {
        matches!(self, HandlerProp::ClassId | HandlerProp::Signature | HandlerProp::MultiSignature)
    }
}

/// Coder and hasher property ids (`NMethodPropID`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MethodProp {
    Id                = 0,
    Name              = 1,
    Decoder           = 2,
    Encoder           = 3,
    PackStreams       = 4,
    UnpackStreams     = 5,
    Description       = 6,
    DecoderIsAssigned = 7,
    EncoderIsAssigned = 8,
    DigestSize        = 9,
    IsFilter          = 10,
}

impl MethodProp {
    #[inline]
    pub fn id(self) -> u32 { self as u32 }

    pub fn name(self) -> &'static str {
        match self {
            MethodProp::Id                => "ID",
            MethodProp::Name              => "Name",
            MethodProp::Decoder           => "Decoder",
            MethodProp::Encoder           => "Encoder",
            MethodProp::PackStreams       => "PackStreams",
            MethodProp::UnpackStreams     => "UnpackStreams",
            MethodProp::Description       => "Description",
            MethodProp::DecoderIsAssigned => "DecoderIsAssigned",
            MethodProp::EncoderIsAssigned => "EncoderIsAssigned",
            MethodProp::DigestSize        => "DigestSize",
            MethodProp::IsFilter          => "IsFilter",
        }
    }

    pub fn is_binary(self) -> bool {
        matches!(self, MethodProp::Decoder | MethodProp::Encoder)
    }
}
