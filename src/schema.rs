use sea_query::Iden;

/// Metadata table - key-value store for catalog configuration
#[derive(Iden)]
pub enum Metadata {
    Table,
    Key,
    Value,
}

/// Segments table - one row per archived audio file
#[derive(Iden)]
pub enum Segments {
    Table,
    Id,
    Filename,
    ArchivedPath,
    StartTsMs,
    EndTsMs,
    IsPublished,
    Sha256Hash,
    CreatedAtMs,
    UpdatedAtMs,
}

/// Download logs table - one append-only row per retrieval
#[derive(Iden)]
pub enum DownloadLogs {
    Table,
    Id,
    SegmentId,
    DownloadedAtMs,
    IpAddress,
    UserAgent,
}
