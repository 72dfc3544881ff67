use std::path::Path;

use axum::Router;
use tower_http::services::ServeDir;

/// Router that serves everything below `root` from a single fallback
/// service. Directories resolve to their `index.html`.
pub fn static_files(root: &Path) -> Router {
    Router::new().fallback_service(ServeDir::new(root))
}
