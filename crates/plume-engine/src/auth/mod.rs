mod service_account;
mod sigv4;

pub use service_account::{ServiceAccountKey, ServiceAccountTokenSource};
pub use sigv4::{aws_percent_encode, SigV4Signer, SigV4Timestamp, SignedRequest};
