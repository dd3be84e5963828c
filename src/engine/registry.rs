use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, Entity};

fn require_admin(principal: &Principal) -> Result<(), EngineError> {
    if principal.is_admin {
        Ok(())
    } else {
        Err(EngineError::Forbidden("administrator required"))
    }
}

fn validate_text(value: &str, field: &str, max: usize, limit: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded(limit));
    }
    Ok(())
}

fn validate_note(note: &Option<String>) -> Result<(), EngineError> {
    match note {
        Some(n) if n.len() > MAX_NOTE_LEN => Err(EngineError::LimitExceeded("maintenance note too long")),
        _ => Ok(()),
    }
}

impl Engine {
    // ── Users ────────────────────────────────────────────────

    pub async fn register_user(
        &self,
        principal: &Principal,
        id: Ulid,
        name: String,
        is_admin: bool,
    ) -> Result<(), EngineError> {
        require_admin(principal)?;
        validate_text(&name, "name", MAX_NAME_LEN, "user name too long")?;
        if id.is_nil() {
            return Err(EngineError::Validation("user id must not be nil".into()));
        }

        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;
        if self.users.len() >= MAX_USERS_PER_SITE {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(Entity::User, id));
        }

        self.persist_and_apply(None, &Event::UserRegistered { id, name, is_admin })
            .await?;
        info!("user {id} registered (admin: {is_admin})");
        Ok(())
    }

    pub async fn update_user(
        &self,
        principal: &Principal,
        id: Ulid,
        name: Option<String>,
        is_admin: Option<bool>,
    ) -> Result<UserInfo, EngineError> {
        require_admin(principal)?;
        if let Some(n) = &name {
            validate_text(n, "name", MAX_NAME_LEN, "user name too long")?;
        }

        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;
        let current = self
            .user_snapshot(&id)
            .ok_or(EngineError::NotFound(Entity::User, id))?;

        let event = Event::UserUpdated {
            id,
            name: name.unwrap_or(current.name),
            is_admin: is_admin.unwrap_or(current.is_admin),
        };
        self.persist_and_apply(None, &event).await?;
        self.user_snapshot(&id)
            .map(|u| UserInfo::from(&u))
            .ok_or(EngineError::NotFound(Entity::User, id))
    }

    pub fn get_user(&self, principal: &Principal, id: Ulid) -> Result<UserInfo, EngineError> {
        if !principal.may_access(&id) {
            return Err(EngineError::Forbidden("cannot view another user"));
        }
        self.users
            .get(&id)
            .map(|u| UserInfo::from(u.value()))
            .ok_or(EngineError::NotFound(Entity::User, id))
    }

    pub fn list_users(&self, principal: &Principal) -> Result<Vec<UserInfo>, EngineError> {
        require_admin(principal)?;
        let mut users: Vec<UserInfo> = self.users.iter().map(|u| UserInfo::from(u.value())).collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    // ── Certifications ───────────────────────────────────────

    /// Clear a user to operate a machine. Returns false if already certified.
    pub async fn grant_certification(
        &self,
        principal: &Principal,
        user_id: Ulid,
        machine_id: Ulid,
    ) -> Result<bool, EngineError> {
        require_admin(principal)?;
        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;

        let user = self
            .user_snapshot(&user_id)
            .ok_or(EngineError::NotFound(Entity::User, user_id))?;
        if !self.machines.contains_key(&machine_id) {
            return Err(EngineError::NotFound(Entity::Machine, machine_id));
        }
        if user.is_certified_for(&machine_id) {
            return Ok(false);
        }
        if user.certifications.len() >= MAX_CERTIFICATIONS_PER_USER {
            return Err(EngineError::LimitExceeded("too many certifications"));
        }

        self.persist_and_apply(None, &Event::CertificationGranted { user_id, machine_id })
            .await?;
        info!("user {user_id} certified for machine {machine_id}");
        Ok(true)
    }

    /// Returns false if the user did not hold the certification.
    pub async fn revoke_certification(
        &self,
        principal: &Principal,
        user_id: Ulid,
        machine_id: Ulid,
    ) -> Result<bool, EngineError> {
        require_admin(principal)?;
        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;

        let user = self
            .user_snapshot(&user_id)
            .ok_or(EngineError::NotFound(Entity::User, user_id))?;
        if !user.is_certified_for(&machine_id) {
            return Ok(false);
        }

        self.persist_and_apply(None, &Event::CertificationRevoked { user_id, machine_id })
            .await?;
        info!("user {user_id} certification for machine {machine_id} revoked");
        Ok(true)
    }

    pub fn list_certifications(&self, principal: &Principal, user_id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        if !principal.may_access(&user_id) {
            return Err(EngineError::Forbidden("cannot view another user"));
        }
        self.users
            .get(&user_id)
            .map(|u| u.certifications.iter().copied().collect())
            .ok_or(EngineError::NotFound(Entity::User, user_id))
    }

    // ── Machines ─────────────────────────────────────────────

    pub async fn create_machine(
        &self,
        principal: &Principal,
        id: Ulid,
        name: String,
        kind: String,
        requires_certification: bool,
    ) -> Result<(), EngineError> {
        require_admin(principal)?;
        validate_text(&name, "name", MAX_NAME_LEN, "machine name too long")?;
        if kind.len() > MAX_TYPE_LEN {
            return Err(EngineError::LimitExceeded("machine type too long"));
        }

        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;
        if self.machines.len() >= MAX_MACHINES_PER_SITE {
            return Err(EngineError::LimitExceeded("too many machines"));
        }
        // Orphaned bookings still name a deleted machine's id; never hand it out again.
        if self.machines.contains_key(&id) || self.bookings.iter().any(|b| b.machine_id == id) {
            return Err(EngineError::AlreadyExists(Entity::Machine, id));
        }

        let event = Event::MachineCreated {
            id,
            name: name.clone(),
            kind: kind.clone(),
            requires_certification,
            status: MachineStatus::Available,
            maintenance_note: None,
            held_slots: Vec::new(),
        };
        self.wal_append(&event).await?;
        let machine = Machine::new(id, name, kind, requires_certification);
        self.machines
            .insert(id, Arc::new(RwLock::new(MachineState::new(machine))));
        info!("machine {id} created");
        Ok(())
    }

    /// Edit admin-owned fields. Held slots are never touched here.
    pub async fn update_machine(
        &self,
        principal: &Principal,
        id: Ulid,
        patch: MachinePatch,
    ) -> Result<Machine, EngineError> {
        require_admin(principal)?;
        if let Some(n) = &patch.name {
            validate_text(n, "name", MAX_NAME_LEN, "machine name too long")?;
        }
        if patch.kind.as_ref().is_some_and(|k| k.len() > MAX_TYPE_LEN) {
            return Err(EngineError::LimitExceeded("machine type too long"));
        }
        if let Some(note) = &patch.maintenance_note {
            validate_note(note)?;
        }

        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;
        let rs = self
            .machine_state(&id)
            .ok_or(EngineError::NotFound(Entity::Machine, id))?;
        let mut guard = rs.write().await;
        let current = &guard.machine;

        let event = Event::MachineUpdated {
            id,
            name: patch.name.unwrap_or_else(|| current.name.clone()),
            kind: patch.kind.unwrap_or_else(|| current.kind.clone()),
            requires_certification: patch
                .requires_certification
                .unwrap_or(current.requires_certification),
            status: patch.status.unwrap_or(current.status),
            maintenance_note: patch
                .maintenance_note
                .unwrap_or_else(|| current.maintenance_note.clone()),
        };
        self.persist_and_apply(Some(&mut *guard), &event).await?;
        info!("machine {id} updated (status: {})", guard.machine.status);
        Ok(guard.machine.clone())
    }

    /// Remove a machine. Its bookings stay in the store as orphans.
    pub async fn delete_machine(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        require_admin(principal)?;
        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;
        let rs = self
            .machine_state(&id)
            .ok_or(EngineError::NotFound(Entity::Machine, id))?;
        // Wait out in-flight booking operations on this machine.
        let guard = rs.write().await;
        let orphaned = guard.booking_ids().count();

        self.wal_append(&Event::MachineDeleted { id }).await?;
        self.machines.remove(&id);
        drop(guard);
        info!("machine {id} deleted ({orphaned} bookings orphaned)");
        Ok(())
    }

    pub async fn get_machine(&self, id: Ulid) -> Result<Machine, EngineError> {
        let rs = self
            .machine_state(&id)
            .ok_or(EngineError::NotFound(Entity::Machine, id))?;
        let guard = rs.read().await;
        Ok(guard.machine.clone())
    }

    pub async fn list_machines(&self) -> Vec<Machine> {
        let states: Vec<_> = self.machines.iter().map(|e| e.value().clone()).collect();
        let mut machines = Vec::with_capacity(states.len());
        for rs in states {
            machines.push(rs.read().await.machine.clone());
        }
        machines.sort_by_key(|m| m.id);
        machines
    }
}
