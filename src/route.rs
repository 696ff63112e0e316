//! Route Resolver (spec.md §4.5; C6).
//!
//! Deterministically maps `(channel, accountId, peer)` onto the agent and
//! session keys the dispatcher and session store operate on (spec.md I4:
//! the same triple always resolves to the same route).

use crate::{AccountId, AgentId, ChannelTag, Peer, Route};

/// Resolves routes for a single configured agent binding. Multiple
/// `RouteResolver`s may exist if different channels/accounts are bound to
/// different agents; the gateway's config layer owns picking the right one
/// per account (see `config` module).
#[derive(Debug, Clone)]
pub struct RouteResolver {
    pub agent_id: AgentId,
}

impl RouteResolver {
    pub fn new(agent_id: AgentId) -> Self {
        Self { agent_id }
    }

    /// Resolves the route for one inbound conversation.
    ///
    /// `session_key` is a stable, deterministic string built from the agent,
    /// channel, account, and peer so repeated calls for the same
    /// conversation always land on the same session (I4), in the
    /// `agent:<agentId>:<scope>` shape the GLOSSARY defines. For group
    /// chats, `main_session_key` is the group-wide key shared by every
    /// member; for direct messages it equals `session_key`.
    pub fn resolve(&self, channel: &ChannelTag, account_id: &AccountId, peer: &Peer) -> Route {
        let agent_id = &self.agent_id;
        let main_session_key = match peer {
            Peer::Direct { id } => format!("agent:{agent_id}:{channel}:{account_id}:dm:{id}"),
            Peer::Group { id } => format!("agent:{agent_id}:{channel}:{account_id}:group:{id}"),
        };

        Route {
            agent_id: self.agent_id.clone(),
            account_id: account_id.clone(),
            session_key: main_session_key.clone(),
            main_session_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_deterministic_for_same_triple() {
        let resolver = RouteResolver::new(AgentId::from("main"));
        let channel = ChannelTag::from("mezon");
        let account = AccountId::from("default");
        let peer = Peer::Direct { id: "u1".into() };

        let first = resolver.resolve(&channel, &account, &peer);
        let second = resolver.resolve(&channel, &account, &peer);

        assert_eq!(first.session_key, second.session_key);
        assert_eq!(first.main_session_key, second.main_session_key);
    }

    #[test]
    fn direct_and_group_session_keys_differ() {
        let resolver = RouteResolver::new(AgentId::from("main"));
        let channel = ChannelTag::from("mezon");
        let account = AccountId::from("default");

        let dm = resolver.resolve(&channel, &account, &Peer::Direct { id: "u1".into() });
        let group = resolver.resolve(&channel, &account, &Peer::Group { id: "u1".into() });

        assert_ne!(dm.session_key, group.session_key);
    }

    #[test]
    fn group_route_shares_main_session_key_with_session_key() {
        let resolver = RouteResolver::new(AgentId::from("main"));
        let channel = ChannelTag::from("slack");
        let account = AccountId::from("default");
        let peer = Peer::Group { id: "C123".into() };

        let route = resolver.resolve(&channel, &account, &peer);
        assert_eq!(route.session_key, route.main_session_key);
    }
}
