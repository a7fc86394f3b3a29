use std::path::PathBuf;
use std::sync::Arc;

use dataset_uploader::scheduler::UploadScheduler;
use dataset_uploader::validator::PathValidator;

pub struct AppState {
    pub scheduler: UploadScheduler,
    /// Allow-list used to reject remote paths before they are queued / 提交时的路径校验
    pub validator: Arc<dyn PathValidator>,
    /// 客户端上传的暂存目录
    pub staging_dir: PathBuf,
}
