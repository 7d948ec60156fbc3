//! Update descriptors as exposed to clients.

use serde::Serialize;
use wuremote_agent::AgentUpdate;

/// Client-facing view of one entry in the last fetched update list.
///
/// Two descriptors are equal when they are the same instance or carry the
/// same non-empty id; other fields do not participate.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescriptor {
    pub id: String,
    pub title: String,
    pub description: String,
    pub is_important: bool,
    pub min_download_size: u64,
    pub max_download_size: u64,
    pub is_installed: bool,
    pub is_downloaded: bool,
    pub eula_accepted: bool,
    pub is_selected: bool,
}

impl PartialEq for UpdateDescriptor {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other) || (!self.id.is_empty() && self.id == other.id)
    }
}

impl From<&AgentUpdate> for UpdateDescriptor {
    fn from(update: &AgentUpdate) -> Self {
        Self {
            id: update.id.clone(),
            title: update.title.clone(),
            description: update.description.clone(),
            is_important: update.is_important,
            min_download_size: update.min_download_size,
            max_download_size: update.max_download_size,
            is_installed: update.is_installed,
            is_downloaded: update.is_downloaded,
            eula_accepted: update.eula_accepted,
            is_selected: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_by_id() {
        let a = UpdateDescriptor::from(&AgentUpdate::new("KB1", "first"));
        let mut b = a.clone();
        b.title = "renamed".into();
        b.is_selected = true;
        assert_eq!(a, b);

        let other = UpdateDescriptor::from(&AgentUpdate::new("KB2", "first"));
        assert_ne!(a, other);
    }

    #[test]
    fn test_empty_ids_only_equal_to_themselves() {
        let a = UpdateDescriptor::from(&AgentUpdate::new("", "anonymous"));
        let b = a.clone();
        assert_eq!(a, a);
        assert_ne!(a, b);
    }

    #[test]
    fn test_serializes_camel_case() {
        let update = AgentUpdate::new("KB7", "seven").important().downloaded();
        let json = serde_json::to_value(UpdateDescriptor::from(&update)).unwrap();
        assert_eq!(json["isImportant"], true);
        assert_eq!(json["isDownloaded"], true);
        assert_eq!(json["isSelected"], false);
    }
}
