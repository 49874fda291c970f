use std::collections::HashMap;

use tracing::{debug, info};

use lanchat_shared::constants::NULL_ID;
use lanchat_shared::listing::{encode_clients, ChatroomEntry, ClientEntry};
use lanchat_shared::types::short_id;
use lanchat_shared::{ChatroomId, ClientId, ControlInfo, Message};

use crate::session::SessionHandle;

/// What `remove_client` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    NotMember,
    Left,
    /// The last member left a room that is not permanent; the caller
    /// should tear it down.
    LeftEmpty,
}

pub struct Chatroom {
    id: ChatroomId,
    name: String,
    permanent: bool,
    members: HashMap<ClientId, SessionHandle>,
}

impl Chatroom {
    pub fn new(id: ChatroomId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            permanent: false,
            members: HashMap::new(),
        }
    }

    /// A room that survives becoming empty.
    pub fn permanent(id: ChatroomId, name: impl Into<String>) -> Self {
        Self {
            permanent: true,
            ..Self::new(id, name)
        }
    }

    pub fn id(&self) -> ChatroomId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn client_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, client: &ClientId) -> bool {
        self.members.contains_key(client)
    }

    pub fn entry(&self) -> ChatroomEntry {
        ChatroomEntry {
            id: self.id,
            name: self.name.clone(),
            member_count: self.members.len(),
        }
    }

    /// Register a member and tell everyone.
    ///
    /// Existing members get a join notice, the joiner gets its own, then the
    /// membership list goes to all members. Returns `false` and does nothing
    /// if the client is already in the room.
    pub fn add_client(&mut self, session: SessionHandle) -> bool {
        let client = session.id();
        if self.members.contains_key(&client) {
            return false;
        }
        self.members.insert(client, session.clone());

        let notice = Message::control(ControlInfo::ClientJoinedChatroom, client, self.id)
            .with_text(format!("Client '{}' has joined the chat.", session.display_name()));
        self.broadcast(&notice, Some(client));

        let own = notice.with_text("You are now a member of this chatroom.");
        let _ = session.send(&own);

        self.broadcast(&self.client_list_message(), None);

        info!(
            room = %short_id(&self.id),
            client = %short_id(&client),
            members = self.members.len(),
            "Client joined chatroom"
        );
        true
    }

    /// Drop a member and tell everyone, including the leaver if it is still
    /// connected.
    pub fn remove_client(&mut self, client: ClientId) -> Departure {
        let Some(session) = self.members.remove(&client) else {
            return Departure::NotMember;
        };

        let notice = Message::control(ControlInfo::ClientLeftChatroom, client, self.id)
            .with_text(format!("Client '{}' has left the chat.", session.display_name()));
        self.broadcast(&notice, Some(client));

        let list = self.client_list_message();
        if session.is_connected() {
            let _ = session.send(&notice.with_text("You have left this chatroom."));
            let _ = session.send(&list);
        }
        self.broadcast(&list, None);

        info!(
            room = %short_id(&self.id),
            client = %short_id(&client),
            members = self.members.len(),
            "Client left chatroom"
        );

        if self.members.is_empty() && !self.permanent {
            debug!(room = %short_id(&self.id), "Chatroom became empty");
            Departure::LeftEmpty
        } else {
            Departure::Left
        }
    }

    /// Queue for every member except `except`. Never waits on a member; one
    /// that cannot keep up is reported through its own session events.
    pub fn broadcast(&self, message: &Message, except: Option<ClientId>) {
        for (id, session) in &self.members {
            if Some(*id) != except {
                let _ = session.send(message);
            }
        }
    }

    /// `ListOfClients` for this room, sent with the room id as sender.
    pub fn client_list_message(&self) -> Message {
        let entries: Vec<ClientEntry> = self
            .members
            .values()
            .map(|s| ClientEntry {
                id: s.id(),
                display_name: s.display_name().to_string(),
            })
            .collect();
        Message::control(ControlInfo::ListOfClients, self.id, NULL_ID).with_text(encode_clients(&entries))
    }
}
