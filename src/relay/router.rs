//! Hub-side routing decision.
//!
//! | Message | Recipients |
//! |---------|------------|
//! | no target | every registered channel except the origin |
//! | target `Hub` | none, handled locally |
//! | target `Panel` / `Tab(n)` | channels registered under exactly that identity |
//!
//! A target with no registered channel is a routing miss: the message is
//! dropped, never queued.

// ============================================================================
// Imports
// ============================================================================

use crate::identifiers::{ChannelName, ContextId};
use crate::protocol::Message;

use super::registry::ChannelRegistry;

// ============================================================================
// Route
// ============================================================================

/// Where the hub sends one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Fan out to these channels.
    Forward(Vec<ChannelName>),
    /// Addressed to the hub itself.
    Local,
    /// Target not registered; drop.
    Miss(ContextId),
}

impl Route {
    /// Channels to post to.
    #[must_use]
    pub fn recipients(&self) -> &[ChannelName] {
        match self {
            Self::Forward(names) => names,
            Self::Local | Self::Miss(_) => &[],
        }
    }
}

/// Decides the recipients of `message` arriving on `origin`.
///
/// `origin` is `None` for messages the hub sends itself.
#[must_use]
pub fn route(registry: &ChannelRegistry, message: &Message, origin: Option<&ChannelName>) -> Route {
    match message.target {
        None => Route::Forward(
            registry
                .iter()
                .filter(|channel| Some(&channel.name) != origin)
                .map(|channel| channel.name.clone())
                .collect(),
        ),

        Some(ContextId::Hub) => Route::Local,

        Some(target) => {
            let names: Vec<_> = registry
                .iter()
                .filter(|channel| channel.identity.matches(&target))
                .map(|channel| channel.name.clone())
                .collect();

            if names.is_empty() {
                Route::Miss(target)
            } else {
                Route::Forward(names)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use serde_json::Value;

    use crate::protocol::MessageType;
    use crate::relay::registry::tests::live;

    fn tab(n: u32) -> ContextId {
        ContextId::tab(n)
    }

    fn registry_with(identities: &[ContextId]) -> (ChannelRegistry, Vec<ChannelName>) {
        let mut registry = ChannelRegistry::new();
        let mut names = Vec::new();
        for (link, identity) in identities.iter().enumerate() {
            let (channel, _) = live(*identity, link as u64 + 1);
            names.push(channel.name.clone());
            registry.register(channel);
        }
        (registry, names)
    }

    fn ping(source: ContextId, target: Option<ContextId>) -> Message {
        Message::new(MessageType::Ping, Value::Null, source, target)
    }

    #[test]
    fn test_broadcast_skips_origin() {
        let (registry, names) = registry_with(&[ContextId::Panel, tab(3), tab(4)]);
        let message = ping(ContextId::Panel, None);

        let route = route(&registry, &message, Some(&names[0]));
        let mut recipients = route.recipients().to_vec();
        recipients.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        let mut expected = vec![names[1].clone(), names[2].clone()];
        expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(recipients, expected);
    }

    #[test]
    fn test_hub_broadcast_reaches_everyone() {
        let (registry, _) = registry_with(&[ContextId::Panel, tab(3)]);
        let route = route(&registry, &ping(ContextId::Hub, None), None);
        assert_eq!(route.recipients().len(), 2);
    }

    #[test]
    fn test_tab_target_matches_exact_tab() {
        let (registry, names) = registry_with(&[ContextId::Panel, tab(3), tab(7), tab(70)]);
        let message = ping(ContextId::Panel, Some(tab(7)));

        assert_eq!(
            route(&registry, &message, Some(&names[0])),
            Route::Forward(vec![names[2].clone()])
        );
    }

    #[test]
    fn test_hub_target_is_local() {
        let (registry, _) = registry_with(&[ContextId::Panel]);
        let message = ping(ContextId::Panel, Some(ContextId::Hub));
        assert_eq!(route(&registry, &message, None), Route::Local);
    }

    #[test]
    fn test_unregistered_target_is_miss() {
        let (registry, _) = registry_with(&[ContextId::Panel, tab(3)]);
        let message = ping(ContextId::Panel, Some(tab(9)));
        assert_eq!(route(&registry, &message, None), Route::Miss(tab(9)));
        assert!(Route::Miss(tab(9)).recipients().is_empty());
    }

    fn identity_strategy() -> impl Strategy<Value = ContextId> {
        prop_oneof![
            Just(ContextId::Panel),
            (1u32..6).prop_map(|n| ContextId::tab(n)),
        ]
    }

    proptest! {
        #[test]
        fn prop_broadcast_never_echoes(
            identities in proptest::collection::vec(identity_strategy(), 1..8),
            origin_index in 0usize..8,
        ) {
            let (registry, names) = registry_with(&identities);
            let origin = &names[origin_index % names.len()];
            let message = ping(ContextId::Panel, None);

            let routed = route(&registry, &message, Some(origin));
            prop_assert!(!routed.recipients().contains(origin));
            prop_assert_eq!(routed.recipients().len(), names.len() - 1);
        }

        #[test]
        fn prop_targeted_only_reaches_target(
            identities in proptest::collection::vec(identity_strategy(), 1..8),
            target in identity_strategy(),
        ) {
            let (registry, _) = registry_with(&identities);
            let message = ping(ContextId::Hub, Some(target));

            match route(&registry, &message, None) {
                Route::Forward(names) => {
                    for name in &names {
                        let channel = registry.by_name(name).unwrap();
                        prop_assert_eq!(channel.identity, target);
                    }
                    let expected = identities.iter().filter(|i| **i == target).count();
                    prop_assert_eq!(names.len(), expected);
                }
                Route::Miss(missed) => {
                    prop_assert_eq!(missed, target);
                    prop_assert!(!identities.contains(&target));
                }
                Route::Local => prop_assert!(false, "non-hub target routed locally"),
            }
        }
    }
}
