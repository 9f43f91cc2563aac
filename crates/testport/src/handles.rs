//! Thin, borrowed views over worlds, players and menus of a running [`Framework`].

use std::time::Duration;

use testport_core::{normalize_material_key, BlockPos, MenuItemSnapshot, WorldEnvironment, WorldType};
use uuid::Uuid;

use crate::client::{CreatePlayerRequest, MenuSnapshot};
use crate::framework::{Framework, FrameworkError, WorldSpec};
use crate::registry::ResourceScope;
use crate::wait::{wait_until, WaitError};

#[derive(Clone)]
pub struct WorldHandle<'a> {
    framework: &'a Framework,
    name: String,
}

impl<'a> WorldHandle<'a> {
    pub(crate) fn new(framework: &'a Framework, name: String) -> Self {
        Self { framework, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_type(&self, pos: BlockPos) -> Result<String, FrameworkError> {
        self.framework.block_type(&self.name, pos)
    }

    /// Returns the material actually placed.
    pub fn set_block(&self, pos: BlockPos, material: &str) -> Result<String, FrameworkError> {
        self.framework.set_block(&self.name, pos, material)
    }
}

pub struct WorldBuilder<'a> {
    framework: &'a Framework,
    spec: WorldSpec,
}

impl<'a> WorldBuilder<'a> {
    pub(crate) fn new(framework: &'a Framework, name: String) -> Self {
        Self {
            framework,
            spec: WorldSpec::new(name),
        }
    }

    pub fn world_type(mut self, world_type: WorldType) -> Self {
        self.spec.world_type = world_type;
        self
    }

    pub fn environment(mut self, environment: WorldEnvironment) -> Self {
        self.spec.environment = environment;
        self
    }

    pub fn seed(mut self, seed: i64) -> Self {
        self.spec.seed = seed;
        self
    }

    pub fn build(self) -> Result<WorldHandle<'a>, FrameworkError> {
        self.framework.new_world(&self.spec)
    }
}

pub struct PlayerBuilder<'a> {
    framework: &'a Framework,
    scope: ResourceScope,
    request: CreatePlayerRequest,
}

impl<'a> PlayerBuilder<'a> {
    pub(crate) fn new(framework: &'a Framework, name: String, scope: ResourceScope) -> Self {
        Self {
            framework,
            scope,
            request: CreatePlayerRequest {
                name,
                uuid: Uuid::new_v4(),
                world: String::new(),
                position: None,
                health: None,
                permissions: Vec::new(),
            },
        }
    }

    pub fn uuid(mut self, id: Uuid) -> Self {
        self.request.uuid = id;
        self
    }

    /// Defaults to the main world.
    pub fn world(mut self, world: &WorldHandle<'_>) -> Self {
        self.request.world = world.name().to_string();
        self
    }

    pub fn world_name(mut self, world: impl Into<String>) -> Self {
        self.request.world = world.into();
        self
    }

    /// Defaults to the world's spawn location.
    pub fn position(mut self, x: f64, y: f64, z: f64) -> Self {
        self.request.position = Some((x, y, z));
        self
    }

    pub fn health(mut self, health: f64) -> Self {
        self.request.health = Some(health);
        self
    }

    pub fn permission(mut self, node: impl Into<String>) -> Self {
        self.request.permissions.push(node.into());
        self
    }

    pub fn build(self) -> Result<PlayerHandle<'a>, FrameworkError> {
        self.framework.spawn_player(self.request, self.scope)
    }
}

#[derive(Clone)]
pub struct PlayerHandle<'a> {
    framework: &'a Framework,
    uuid: Uuid,
    name: String,
    world: String,
}

impl<'a> PlayerHandle<'a> {
    pub(crate) fn new(framework: &'a Framework, uuid: Uuid, name: String, world: String) -> Self {
        Self {
            framework,
            uuid,
            name,
            world,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// World the player was spawned into.
    pub fn world_name(&self) -> &str {
        &self.world
    }

    pub fn execute_command(&self, command: &str) -> Result<bool, FrameworkError> {
        self.framework.execute_player_command(self.uuid, command)
    }

    pub fn place_block(&self, material: &str, pos: BlockPos) -> Result<String, FrameworkError> {
        self.framework.place_player_block(self.uuid, material, pos)
    }

    pub fn wait_ticks(&self, ticks: i64) -> Result<(), FrameworkError> {
        self.framework.wait_ticks(ticks)
    }

    /// Chat received since the previous call.
    pub fn messages(&self) -> Result<Vec<String>, FrameworkError> {
        self.framework.player_messages(self.uuid)
    }

    /// The player's open menu, if any.
    pub fn open_menu(&self) -> Result<Option<MenuHandle<'a>>, FrameworkError> {
        let snapshot = self.framework.menu_snapshot(self.uuid)?;
        let open = snapshot.open;
        Ok(open.then(|| MenuHandle::new(self.framework, self.uuid, snapshot)))
    }

    pub fn wait_for_menu(&self, timeout: Duration) -> Result<MenuHandle<'a>, FrameworkError> {
        let mut opened = None;
        wait_until(
            || {
                let snapshot = self.framework.menu_snapshot(self.uuid)?;
                let open = snapshot.open;
                if open {
                    opened = Some(snapshot);
                }
                Ok::<_, FrameworkError>(open)
            },
            timeout,
        )?;
        match opened {
            Some(snapshot) => Ok(MenuHandle::new(self.framework, self.uuid, snapshot)),
            None => Err(WaitError::Timeout { timeout }.into()),
        }
    }

    pub fn remove(self) -> Result<(), FrameworkError> {
        self.framework.remove_player(self.uuid)
    }
}

/// Snapshot of an open menu plus the player it belongs to.
pub struct MenuHandle<'a> {
    framework: &'a Framework,
    player: Uuid,
    snapshot: MenuSnapshot,
}

impl<'a> MenuHandle<'a> {
    fn new(framework: &'a Framework, player: Uuid, snapshot: MenuSnapshot) -> Self {
        Self {
            framework,
            player,
            snapshot,
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.snapshot.title.as_deref()
    }

    pub fn items(&self) -> &[MenuItemSnapshot] {
        &self.snapshot.items
    }

    pub fn item(&self, slot: i32) -> Option<&MenuItemSnapshot> {
        self.snapshot.items.iter().find(|item| item.slot == slot)
    }

    /// Accepts `STONE`, `stone` or `minecraft:stone`.
    pub fn has_item(&self, slot: i32, material: &str) -> bool {
        let wanted = normalize_material_key(material);
        self.item(slot)
            .is_some_and(|item| normalize_material_key(&item.material_key) == wanted)
    }

    pub fn slots_with(&self, material: &str) -> Vec<i32> {
        let wanted = normalize_material_key(material);
        self.snapshot
            .items
            .iter()
            .filter(|item| normalize_material_key(&item.material_key) == wanted)
            .map(|item| item.slot)
            .collect()
    }

    pub fn verify_title(&self, expected: &str) -> Result<(), FrameworkError> {
        if self.title() == Some(expected) {
            return Ok(());
        }
        Err(FrameworkError::MenuTitleMismatch {
            expected: expected.to_string(),
            actual: self.snapshot.title.clone(),
        })
    }

    /// Fresh snapshot; `None` once the menu has closed.
    pub fn refresh(&self) -> Result<Option<MenuHandle<'a>>, FrameworkError> {
        let snapshot = self.framework.menu_snapshot(self.player)?;
        let open = snapshot.open;
        Ok(open.then(|| MenuHandle::new(self.framework, self.player, snapshot)))
    }

    pub fn click(&self, slot: i64) -> Result<(), FrameworkError> {
        self.framework.click_menu_slot(self.player, slot)
    }

    pub fn drag(&self, material: &str, slots: &[i64]) -> Result<(), FrameworkError> {
        self.framework.drag_menu_slots(self.player, material, slots)
    }

    pub fn wait_for_close(&self, timeout: Duration) -> Result<(), FrameworkError> {
        wait_until(
            || Ok::<_, FrameworkError>(!self.framework.menu_snapshot(self.player)?.open),
            timeout,
        )?;
        Ok(())
    }
}
