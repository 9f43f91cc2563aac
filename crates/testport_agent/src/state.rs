use std::collections::HashMap;

use testport_core::Location;
use tracing::{info, warn};
use uuid::Uuid;

use crate::host::{GameHost, HostError, PlatformAdapter, SpawnedPlayer};

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSpawn {
    pub id: Uuid,
    pub name: String,
    pub world: String,
    pub location: Option<Location>,
    pub health: Option<f64>,
    pub permissions: Vec<String>,
}

/// Main-thread state: the host plus the synthetic players the agent created.
pub struct AgentState {
    host: Box<dyn GameHost>,
    adapter: Box<dyn PlatformAdapter>,
    players: HashMap<Uuid, SpawnedPlayer>,
}

impl AgentState {
    pub fn new(host: Box<dyn GameHost>, adapter: Box<dyn PlatformAdapter>) -> Self {
        Self {
            host,
            adapter,
            players: HashMap::new(),
        }
    }

    pub fn host(&self) -> &dyn GameHost {
        self.host.as_ref()
    }

    pub fn host_mut(&mut self) -> &mut dyn GameHost {
        self.host.as_mut()
    }

    pub fn synthetic_player_count(&self) -> usize {
        self.players.len()
    }

    pub fn spawn_player(&mut self, spawn: &PlayerSpawn) -> Result<SpawnedPlayer, HostError> {
        if self.players.contains_key(&spawn.id) {
            return Err(HostError::DuplicatePlayer(spawn.id));
        }
        let location = match spawn.location {
            Some(location) => location,
            None => self.host.spawn_location(&spawn.world)?,
        };
        let player = self.adapter.spawn_player(
            self.host.as_mut(),
            spawn.id,
            &spawn.name,
            &spawn.world,
            location,
        )?;

        let customized = self.apply_profile(spawn);
        if let Err(error) = customized {
            if let Err(rollback) = self.adapter.remove_player(self.host.as_mut(), &player) {
                warn!(player = %player.id, error = %rollback, "synthetic_player_rollback_failed");
            }
            return Err(error);
        }

        info!(player = %player.id, name = %player.name, world = %spawn.world, "synthetic_player_spawned");
        self.players.insert(player.id, player.clone());
        Ok(player)
    }

    /// Returns whether a synthetic player with that id existed.
    pub fn remove_player(&mut self, id: Uuid) -> Result<bool, HostError> {
        let Some(player) = self.players.remove(&id) else {
            return Ok(false);
        };
        self.adapter.remove_player(self.host.as_mut(), &player)?;
        info!(player = %id, "synthetic_player_removed");
        Ok(true)
    }

    /// Removes every synthetic player; individual failures are logged and skipped.
    pub fn remove_all_players(&mut self) -> usize {
        let players: Vec<SpawnedPlayer> = self.players.drain().map(|(_, player)| player).collect();
        let mut removed = 0usize;
        for player in &players {
            match self.adapter.remove_player(self.host.as_mut(), player) {
                Ok(()) => removed += 1,
                Err(error) => {
                    warn!(player = %player.id, error = %error, "synthetic_player_cleanup_failed");
                }
            }
        }
        removed
    }

    pub fn require_player(&self, id: Uuid) -> Result<&SpawnedPlayer, HostError> {
        self.players.get(&id).ok_or(HostError::UnknownPlayer(id))
    }

    pub fn drain_messages(&mut self, id: Uuid) -> Result<Vec<String>, HostError> {
        self.require_player(id)?;
        Ok(self.adapter.drain_received_messages(self.host.as_mut(), id))
    }

    fn apply_profile(&mut self, spawn: &PlayerSpawn) -> Result<(), HostError> {
        if let Some(health) = spawn.health {
            self.host.set_player_health(spawn.id, health)?;
        }
        if !spawn.permissions.is_empty() {
            self.host.grant_permissions(spawn.id, &spawn.permissions)?;
        }
        Ok(())
    }
}
