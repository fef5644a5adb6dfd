//! Authentication: API keys with token buckets, and single-use session
//! access tokens.

pub mod keys;
pub mod middleware;
pub mod tokens;

pub use keys::{ApiKeyService, GeneratedKey};
pub use middleware::require_api_key;
pub use tokens::AccessTokenService;
