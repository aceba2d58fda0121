// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `deactivator.rs`

#[cfg(test)]
mod tests {
    use super::super::{activation_of, item_progress, Activation, ItemProgress};
    use crate::labels::{
        ACTION_DEACTIVATE, ACTION_REACTIVATE, ANNOTATION_ACTION_IGNORE, ANNOTATION_STATUS_IGNORE,
        STATUS_IGNORE,
    };
    use std::collections::BTreeMap;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    /// Test that a pending action wins over the ignore marker
    #[test]
    fn test_activation_of() {
        assert_eq!(activation_of(&annotations(&[])), Activation::Active);
        assert_eq!(
            activation_of(&annotations(&[(ANNOTATION_STATUS_IGNORE, STATUS_IGNORE)])),
            Activation::Deactivated
        );
        assert_eq!(
            activation_of(&annotations(&[
                (ANNOTATION_STATUS_IGNORE, STATUS_IGNORE),
                (ANNOTATION_ACTION_IGNORE, ACTION_REACTIVATE)
            ])),
            Activation::Reactivating
        );
        assert_eq!(
            activation_of(&annotations(&[(ANNOTATION_ACTION_IGNORE, ACTION_DEACTIVATE)])),
            Activation::Deactivating
        );
        assert_eq!(
            activation_of(&annotations(&[(ANNOTATION_ACTION_IGNORE, "bogus")])),
            Activation::Active
        );
    }

    /// Test item progress during a deactivation
    #[test]
    fn test_item_progress_deactivation() {
        let target = Activation::Deactivating;
        assert_eq!(
            item_progress(&annotations(&[(ANNOTATION_STATUS_IGNORE, STATUS_IGNORE)]), target),
            ItemProgress::Done
        );
        assert_eq!(
            item_progress(&annotations(&[(ANNOTATION_ACTION_IGNORE, ACTION_DEACTIVATE)]), target),
            ItemProgress::Informed
        );
        assert_eq!(item_progress(&annotations(&[]), target), ItemProgress::Uninformed);
        assert_eq!(
            item_progress(&annotations(&[(ANNOTATION_ACTION_IGNORE, ACTION_REACTIVATE)]), target),
            ItemProgress::Uninformed,
            "a pending reactivation is overwritten"
        );
    }

    /// Test item progress during a reactivation
    #[test]
    fn test_item_progress_reactivation() {
        let target = Activation::Reactivating;
        assert_eq!(item_progress(&annotations(&[]), target), ItemProgress::Done);
        assert_eq!(
            item_progress(&annotations(&[(ANNOTATION_ACTION_IGNORE, ACTION_REACTIVATE)]), target),
            ItemProgress::Informed
        );
        assert_eq!(
            item_progress(&annotations(&[(ANNOTATION_STATUS_IGNORE, STATUS_IGNORE)]), target),
            ItemProgress::Uninformed
        );
    }
}
