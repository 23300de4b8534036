//! Scenes.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{MeshNetwork, NetworkEvent};
use crate::error::ModelError;

/// A named scene stored on a set of elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    /// Scene number, never zero
    pub number: u16,
    /// Element addresses storing the scene
    pub addresses: Vec<u16>,
    /// Display name
    pub name: String,
}

impl Scene {
    /// A scene not yet stored anywhere.
    pub fn new(number: u16, name: impl Into<String>) -> Self {
        Self { number, addresses: Vec::new(), name: name.into() }
    }
}

impl MeshNetwork {
    /// All scenes.
    pub fn scenes(&self) -> &[Scene] {
        &self.state.scenes
    }

    /// Scene by number.
    pub fn scene(&self, number: u16) -> Option<&Scene> {
        self.state.scenes.iter().find(|scene| scene.number == number)
    }

    /// Create a scene with the next free number of the selected provisioner.
    pub fn create_scene(&mut self, name: impl Into<String>) -> Result<Scene, ModelError> {
        let scene = Scene::new(self.next_available_scene_number()?, name);
        self.add_scene(scene.clone())?;
        Ok(scene)
    }

    /// Add a scene.
    pub fn add_scene(&mut self, scene: Scene) -> Result<(), ModelError> {
        if scene.number == 0 {
            return Err(ModelError::AddressOutOfRange { kind: "scene", address: 0 });
        }
        if self.scene(scene.number).is_some() {
            return Err(ModelError::SceneExists(scene.number));
        }

        let number = scene.number;
        let mut next = self.state.clone();
        next.scenes.push(scene);
        self.commit(next, vec![NetworkEvent::SceneAdded(number)])?;
        debug!(number, "scene added");
        Ok(())
    }

    /// Replace the scene with the same number.
    pub fn update_scene(&mut self, scene: Scene) -> Result<(), ModelError> {
        let number = scene.number;
        if self.scene(number).is_none() {
            return Err(ModelError::SceneNotFound(number));
        }

        let mut next = self.state.clone();
        if let Some(slot) = next.scenes.iter_mut().find(|s| s.number == number) {
            *slot = scene;
        }
        self.commit(next, vec![NetworkEvent::SceneUpdated(number)])?;
        debug!(number, "scene updated");
        Ok(())
    }

    /// Remove a scene.
    pub fn remove_scene(&mut self, number: u16) -> Result<Scene, ModelError> {
        let scene = self.scene(number).cloned().ok_or(ModelError::SceneNotFound(number))?;
        let mut next = self.state.clone();
        next.scenes.retain(|s| s.number != number);
        self.commit(next, vec![NetworkEvent::SceneDeleted(number)])?;
        debug!(number, "scene removed");
        Ok(scene)
    }
}
