// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::BTreeMap, sync::Mutex};

use bitflags::bitflags;

use crate::{error::SyncError, util::Signal};

/// Availability of a user within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserStatus {
    /// The user left; the record persists so later requests referring to
    /// this id stay meaningful.
    #[default]
    Unavailable,
    /// Joined but not currently editing.
    Inactive,
    /// Joined and editing.
    Active,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Unavailable => "unavailable",
            UserStatus::Inactive => "inactive",
            UserStatus::Active => "active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "unavailable" => UserStatus::Unavailable,
            "inactive" => UserStatus::Inactive,
            "active" => UserStatus::Active,
            _ => return None,
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UserFlags: u8 {
        /// The user was joined by this process.
        const LOCAL = 1 << 0;
    }
}

/// One participant of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: u32,
    pub name: String,
    pub status: UserStatus,
    pub flags: UserFlags,
    /// Color hue in `[0, 1)`, chosen by the user.
    pub hue: f64,
    /// Caret position in characters.
    pub caret: usize,
    /// Selected characters from the caret; negative selects towards the
    /// beginning of the buffer.
    pub selection: i64,
}

impl User {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: UserStatus::Unavailable,
            flags: UserFlags::empty(),
            hue: 0.0,
            caret: 0,
            selection: 0,
        }
    }

    pub fn is_local(&self) -> bool {
        self.flags.contains(UserFlags::LOCAL)
    }
}

/// The table of all users ever present in a session.
///
/// Records are created on join and never destroyed while the session lives;
/// departure only flips the status to `Unavailable`.
#[derive(Debug, Default)]
pub struct UserTable {
    users: Mutex<BTreeMap<u32, User>>,
    pub user_added: Signal<User>,
    pub status_changed: Signal<User>,
    pub selection_changed: Signal<User>,
}

impl UserTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user record. Ids and names must be unique within the table.
    pub fn add(&self, user: User) -> Result<(), SyncError> {
        {
            let mut users = self.users.lock().expect("user table poisoned");
            if users.contains_key(&user.id) {
                return Err(SyncError::IdInUse(user.id));
            }
            if users.values().any(|u| u.name == user.name) {
                return Err(SyncError::NameInUse(user.name.clone()));
            }
            users.insert(user.id, user.clone());
        }
        self.user_added.emit(&user);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<User> {
        self.users
            .lock()
            .expect("user table poisoned")
            .get(&id)
            .cloned()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<User> {
        self.users
            .lock()
            .expect("user table poisoned")
            .values()
            .find(|u| u.name == name)
            .cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.users
            .lock()
            .expect("user table poisoned")
            .contains_key(&id)
    }

    /// Snapshot of every record in ascending id order.
    pub fn snapshot(&self) -> Vec<User> {
        self.users
            .lock()
            .expect("user table poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Smallest id not yet in use, starting from 1.
    pub fn next_free_id(&self) -> u32 {
        let users = self.users.lock().expect("user table poisoned");
        let mut id = 1;
        while users.contains_key(&id) {
            id += 1;
        }
        id
    }

    pub fn set_status(&self, id: u32, status: UserStatus) -> Result<(), SyncError> {
        let user = {
            let mut users = self.users.lock().expect("user table poisoned");
            let user = users.get_mut(&id).ok_or(SyncError::IdInUse(id))?;
            user.status = status;
            user.clone()
        };
        self.status_changed.emit(&user);
        Ok(())
    }

    /// Moves a user's caret and selection; fired by move operations and by
    /// explicit `set-selection` helpers.
    pub fn set_selection(&self, id: u32, caret: usize, selection: i64) -> bool {
        let user = {
            let mut users = self.users.lock().expect("user table poisoned");
            let Some(user) = users.get_mut(&id) else {
                return false;
            };
            user.caret = caret;
            user.selection = selection;
            user.clone()
        };
        self.selection_changed.emit(&user);
        true
    }

    /// Shifts every non-`by` user's caret across an insert/erase, mirroring
    /// what the issuing site already did through its move operations.
    pub fn adjust_selections_for_insert(&self, by: u32, pos: usize, len: usize) {
        let mut users = self.users.lock().expect("user table poisoned");
        for user in users.values_mut() {
            if user.id == by {
                continue;
            }
            let mut caret = user.caret;
            let mut sel = user.selection;
            crate::text::move_op::transform_selection_insert(
                pos, len, &mut caret, &mut sel, true,
            );
            user.caret = caret;
            user.selection = sel;
        }
    }

    pub fn adjust_selections_for_erase(&self, by: u32, pos: usize, len: usize) {
        let mut users = self.users.lock().expect("user table poisoned");
        for user in users.values_mut() {
            if user.id == by {
                continue;
            }
            let mut caret = user.caret;
            let mut sel = user.selection;
            crate::text::move_op::transform_selection_delete(pos, len, &mut caret, &mut sel);
            user.caret = caret;
            user.selection = sel;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ids_and_names() {
        let table = UserTable::new();
        table.add(User::new(1, "alice")).expect("add alice");

        assert!(matches!(
            table.add(User::new(1, "bob")),
            Err(SyncError::IdInUse(1))
        ));
        assert!(matches!(
            table.add(User::new(2, "alice")),
            Err(SyncError::NameInUse(_))
        ));

        assert_eq!(table.next_free_id(), 2);
        table.add(User::new(2, "bob")).expect("add bob");
        assert_eq!(table.next_free_id(), 3);
    }

    #[test]
    fn test_departure_keeps_record() {
        let table = UserTable::new();
        let mut u = User::new(1, "alice");
        u.status = UserStatus::Active;
        table.add(u).expect("add");

        table
            .set_status(1, UserStatus::Unavailable)
            .expect("set status");
        let user = table.get(1).expect("record persists");
        assert_eq!(user.status, UserStatus::Unavailable);
    }
}
