use thiserror::Error;

#[derive(Error, Debug)]
pub enum PageError {
    #[error("Index name too long: {0}")]
    NameTooLong(String),
    #[error("No header record for index {0}")]
    RecordNotFound(String),
    #[error("Header record already exists for index {0}")]
    DuplicateRecord(String),
    #[error("Header page directory is full")]
    DirectoryFull,
}
