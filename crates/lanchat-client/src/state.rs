//! What the client knows about the server, rebuilt from listings.
//!
//! The server republishes full lists whenever something changes, so every
//! update replaces rather than patches.

use std::collections::{HashMap, HashSet};

use lanchat_shared::constants::PUBLIC_ROOM_ID;
use lanchat_shared::listing::{ChatroomEntry, ClientEntry};
use lanchat_shared::{ChatroomId, ClientId};

#[derive(Debug, Default, Clone)]
pub struct ClientState {
    /// Everyone connected, taken from the public room's member list.
    known_clients: HashMap<ClientId, String>,
    chatrooms: Vec<ChatroomEntry>,
    members: HashMap<ChatroomId, Vec<ClientEntry>>,
    joined: HashSet<ChatroomId>,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_client_list(&mut self, room: ChatroomId, clients: Vec<ClientEntry>) {
        if room == PUBLIC_ROOM_ID {
            self.known_clients = clients
                .iter()
                .map(|c| (c.id, c.display_name.clone()))
                .collect();
        }
        self.members.insert(room, clients);
    }

    /// Replace the room list. Rooms that vanished are forgotten, including
    /// our membership in them.
    pub fn apply_chatroom_list(&mut self, chatrooms: Vec<ChatroomEntry>) {
        let live: HashSet<ChatroomId> = chatrooms.iter().map(|r| r.id).collect();
        self.joined.retain(|id| live.contains(id));
        self.members.retain(|id, _| live.contains(id));
        self.chatrooms = chatrooms;
    }

    pub fn mark_joined(&mut self, room: ChatroomId) {
        self.joined.insert(room);
    }

    pub fn mark_left(&mut self, room: ChatroomId) {
        self.joined.remove(&room);
    }

    pub fn display_name(&self, client: &ClientId) -> Option<&str> {
        self.known_clients.get(client).map(String::as_str)
    }

    /// Known clients sorted by display name.
    pub fn known_clients(&self) -> Vec<ClientEntry> {
        let mut clients: Vec<ClientEntry> = self
            .known_clients
            .iter()
            .map(|(id, name)| ClientEntry {
                id: *id,
                display_name: name.clone(),
            })
            .collect();
        clients.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
        clients
    }

    /// Rooms in the order the server listed them.
    pub fn chatrooms(&self) -> &[ChatroomEntry] {
        &self.chatrooms
    }

    pub fn members(&self, room: &ChatroomId) -> &[ClientEntry] {
        self.members.get(room).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_joined(&self, room: &ChatroomId) -> bool {
        self.joined.contains(room)
    }

    pub fn joined_chatrooms(&self) -> Vec<ChatroomId> {
        let mut rooms: Vec<ChatroomId> = self.joined.iter().copied().collect();
        rooms.sort();
        rooms
    }
}
