//! Rich-text editor bound to a room's shared text body.
//!
//! With a live room the body lives in the room's doc and every edit is
//! shipped to peers; the CRDT carries history, so the editor's own
//! undo stack is off. Without one (a [`NullRoom`](crate::room::NullRoom)
//! or no room at all) the editor works on a private doc with history
//! on. The methods are the same either way.

use std::sync::Mutex;

use serde_json::Value;
use weave_core::document::DEFAULT_NAMESPACE;
use weave_core::{Presence, RichText, TextCursor, UserInfo};

use crate::presence::CollaborationCursor;
use crate::provider::SharedProvider;
use crate::room::{PresenceUpdate, RoomHandle};

#[derive(Debug, Clone, PartialEq)]
pub struct EditorOptions {
    /// Body key inside the room, so several documents can share one
    /// connection.
    pub namespace: String,
    /// Content for a brand-new body. Applied once, after sync, and only
    /// if the body is still empty.
    pub initial_content: Option<String>,
    /// Identity shown on this user's collaboration cursor.
    pub user: Option<UserInfo>,
}

impl Default for EditorOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            initial_content: None,
            user: None,
        }
    }
}

impl EditorOptions {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_initial_content(mut self, content: impl Into<String>) -> Self {
        self.initial_content = Some(content.into());
        self
    }

    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }
}

/// How the editor instance is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditorSettings {
    /// Local undo/redo.
    pub history: bool,
    pub collaborative: bool,
}

pub struct CollaborativeEditor {
    body: RichText,
    room: Option<RoomHandle>,
    /// Set when the editor entered the room itself and must exit it.
    lease: Option<(SharedProvider, RoomHandle)>,
    settings: EditorSettings,
    user: UserInfo,
    pending_content: Mutex<Option<String>>,
    closed: bool,
}

impl CollaborativeEditor {
    /// Bind to the text body of `room`, or fall back to a local body if
    /// the room does not sync text.
    pub fn open(room: &RoomHandle, options: EditorOptions) -> Self {
        match room.text_body(&options.namespace) {
            Some(body) => {
                let user = options
                    .user
                    .unwrap_or_else(|| room.my_presence().user);
                log::debug!(
                    "Editor bound to {}:{}",
                    room.room_id(),
                    body.namespace()
                );
                let editor = Self {
                    body,
                    room: Some(room.clone()),
                    lease: None,
                    settings: EditorSettings {
                        history: false,
                        collaborative: true,
                    },
                    user,
                    pending_content: Mutex::new(options.initial_content),
                    closed: false,
                };
                editor.seed_if_ready();
                editor
            }
            None => Self::local(EditorOptions {
                user: Some(options.user.unwrap_or_else(|| room.my_presence().user)),
                ..options
            }),
        }
    }

    /// Enter `room_id` through `provider` and bind to it. [`close`]
    /// exits the room again.
    ///
    /// [`close`]: CollaborativeEditor::close
    pub fn enter(provider: SharedProvider, room_id: &str, options: EditorOptions) -> Self {
        let user = options.user.clone().unwrap_or_else(UserInfo::anonymous);
        let room = provider.enter(room_id, Presence::initial(user));
        let mut editor = Self::open(&room, options);
        editor.lease = Some((provider, room));
        editor
    }

    /// Plain local editor with no room behind it.
    pub fn local(options: EditorOptions) -> Self {
        let body = RichText::local(&options.namespace);
        if let Some(content) = &options.initial_content {
            body.set_initial_content(content);
        }
        Self {
            body,
            room: None,
            lease: None,
            settings: EditorSettings {
                history: true,
                collaborative: false,
            },
            user: options.user.unwrap_or_else(UserInfo::anonymous),
            pending_content: Mutex::new(None),
            closed: false,
        }
    }

    pub fn settings(&self) -> EditorSettings {
        self.settings
    }

    pub fn namespace(&self) -> &str {
        self.body.namespace()
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    /// The room behind the editor, `None` in local mode.
    pub fn provider(&self) -> Option<&RoomHandle> {
        self.room.as_ref()
    }

    pub fn is_synced(&self) -> bool {
        match &self.room {
            Some(room) => room.is_synced(),
            None => !self.settings.collaborative,
        }
    }

    /// Content is provisional while this is true.
    pub fn is_connecting(&self) -> bool {
        self.room.as_ref().is_some_and(|room| room.is_connecting())
    }

    pub fn connected_users(&self) -> usize {
        self.room.as_ref().map_or(1, |room| room.connected_users())
    }

    /// Wait for the first sync and apply pending initial content.
    /// Returns `false` if the room closed first.
    pub async fn ready(&self) -> bool {
        let synced = match &self.room {
            Some(room) => room.synced().await,
            None => !self.settings.collaborative,
        };
        self.seed_if_ready();
        synced
    }

    fn seed_if_ready(&self) {
        let Some(room) = &self.room else {
            return;
        };
        if !room.is_synced() {
            return;
        }
        let pending = self
            .pending_content
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(update) = pending.and_then(|content| self.body.set_initial_content(&content)) {
            room.submit_update(update);
        }
    }

    fn submit(&self, update: Vec<u8>) {
        if let Some(room) = &self.room {
            room.submit_update(update);
        }
    }

    // ── Editing ──────────────────────────────────────────────────

    pub fn insert(&self, index: u32, chunk: &str) -> bool {
        self.insert_with_marks(index, chunk, &[])
    }

    pub fn insert_with_marks(&self, index: u32, chunk: &str, marks: &[&str]) -> bool {
        if self.closed || chunk.is_empty() {
            return false;
        }
        self.seed_if_ready();
        let update = self.body.insert_with_marks(index, chunk, marks);
        self.submit(update);
        true
    }

    pub fn delete(&self, index: u32, len: u32) -> bool {
        if self.closed {
            return false;
        }
        self.seed_if_ready();
        match self.body.delete(index, len) {
            Some(update) => {
                self.submit(update);
                true
            }
            None => false,
        }
    }

    pub fn format(&self, index: u32, len: u32, marks: &[&str], enabled: bool) -> bool {
        if self.closed {
            return false;
        }
        self.seed_if_ready();
        match self.body.format(index, len, marks, enabled) {
            Some(update) => {
                self.submit(update);
                true
            }
            None => false,
        }
    }

    pub fn text(&self) -> String {
        self.body.text()
    }

    pub fn content_tree(&self) -> Value {
        self.body.to_content_tree()
    }

    // ── Collaboration cursors ────────────────────────────────────

    /// Publish the local caret/selection. Peers see it move with the
    /// text it sits in.
    pub fn set_selection(&self, anchor: u32, head: u32) {
        if self.closed {
            return;
        }
        if let Some(room) = &self.room {
            room.update_presence(PresenceUpdate::TextCursor(Some(TextCursor {
                namespace: self.body.namespace().to_string(),
                anchor: self.body.sticky_index(anchor),
                head: self.body.sticky_index(head),
            })));
        }
    }

    pub fn clear_selection(&self) {
        if let Some(room) = &self.room {
            room.update_presence(PresenceUpdate::TextCursor(None));
        }
    }

    /// Other users' carets in this body.
    pub fn collaboration_cursors(&self) -> Vec<CollaborationCursor> {
        match &self.room {
            Some(room) => room
                .presence()
                .text_cursors(self.body.namespace(), |position| self.body.resolve_sticky_index(position)),
            None => Vec::new(),
        }
    }

    /// Detach from the room. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.clear_selection();
        if let Some(room) = self.room.take() {
            log::debug!("Editor closed for {}:{}", room.room_id(), self.body.namespace());
        }
        if let Some((provider, room)) = self.lease.take() {
            provider.exit(&room);
        }
    }
}

impl Drop for CollaborativeEditor {
    fn drop(&mut self) {
        self.close();
    }
}
