//! Change filter: which updates are worth a sync.

use kube::core::DynamicObject;

/// Compares two versions of an object on identity and desired state only, so
/// status writes and resourceVersion bumps don't cause a sync.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    spec_fields: Vec<String>,
}

impl Default for ChangeFilter {
    fn default() -> Self {
        Self::new(vec!["spec".to_string()])
    }
}

impl ChangeFilter {
    pub fn new(spec_fields: Vec<String>) -> Self {
        Self { spec_fields }
    }

    pub fn should_resync(&self, old: &DynamicObject, new: &DynamicObject) -> bool {
        // Same name, different UID: the object was replaced.
        if old.metadata.uid != new.metadata.uid {
            return true;
        }
        if old.metadata.deletion_timestamp.is_none() && new.metadata.deletion_timestamp.is_some() {
            return true;
        }
        self.spec_fields.iter().any(|f| old.data.get(f) != new.data.get(f))
    }
}
