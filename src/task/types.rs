use serde::{Deserialize, Serialize};

use super::models::TaskSummary;

/// 条目类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ItemKind {
    SingleItem,
    Tree,
}

/// 来源类型（决定占用哪一类并发名额）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OriginClass {
    LocalOrigin,
    RemoteOrigin,
    UrlFetch,
}

/// 并发计数类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdmissionClass {
    Local,
    Remote,
}

impl OriginClass {
    /// url-fetch 不占用名额
    pub fn admission_class(self) -> Option<AdmissionClass> {
        match self {
            OriginClass::LocalOrigin => Some(AdmissionClass::Local),
            OriginClass::RemoteOrigin => Some(AdmissionClass::Remote),
            OriginClass::UrlFetch => None,
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Uploading,
    UploadingToStore,
    Registering,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::CompletedWithErrors | TaskStatus::Failed
        )
    }

    /// 状态机：queued → uploading → (uploading_to_store | registering) → 终态
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self == next {
            return !self.is_terminal();
        }
        match self {
            Queued => matches!(next, Uploading | Failed),
            Uploading => matches!(next, UploadingToStore | Registering | Completed | CompletedWithErrors | Failed),
            UploadingToStore => matches!(next, Registering | Completed | CompletedWithErrors | Failed),
            Registering => matches!(next, Completed | CompletedWithErrors | Failed),
            Completed | CompletedWithErrors | Failed => false,
        }
    }
}

/// 任务事件（用于SSE推送）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskCreated { task: TaskSummary },
    TaskUpdated { task: TaskSummary },
    TaskCompleted { task: TaskSummary },
    TaskFailed { task: TaskSummary },
    TaskRemoved { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(UploadingToStore));
        assert!(UploadingToStore.can_transition_to(UploadingToStore));
        assert!(UploadingToStore.can_transition_to(Registering));
        assert!(Registering.can_transition_to(Completed));
        assert!(Uploading.can_transition_to(CompletedWithErrors));
    }

    #[test]
    fn test_rejected_transitions() {
        use TaskStatus::*;
        assert!(!Queued.can_transition_to(Registering));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Registering.can_transition_to(UploadingToStore));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!CompletedWithErrors.can_transition_to(Uploading));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_value(TaskStatus::CompletedWithErrors).unwrap(), "completed_with_errors");
        assert_eq!(serde_json::to_value(OriginClass::UrlFetch).unwrap(), "url-fetch");
        assert_eq!(serde_json::to_value(ItemKind::SingleItem).unwrap(), "single-item");
        assert_eq!(OriginClass::UrlFetch.admission_class(), None);
        assert_eq!(OriginClass::LocalOrigin.admission_class(), Some(AdmissionClass::Local));
    }
}
