//! Task trait - 型付き Task の定義

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Task は task_type と payload 型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Resize {
///     url: String,
/// }
///
/// impl Task for Resize {
///     const TYPE: &'static str = "media.resize.v1";
///     type Output = serde_json::Value;
/// }
/// ```
///
/// # 命名規約
/// - `{namespace}.{action}.v{major}`
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;

    /// What the handler returns on success; becomes the callback's `result`.
    type Output: Serialize + Send + 'static;
}
