use thiserror::Error;

#[derive(Error, Debug)]
pub enum BucketError {
    #[error("Invalid bucket {bucket}, bucket count is {bucket_count}")]
    InvalidBucket { bucket: u32, bucket_count: u32 },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Leadership lost: {0}")]
    LeadershipLost(String),
}

pub type Result<T> = std::result::Result<T, BucketError>;
