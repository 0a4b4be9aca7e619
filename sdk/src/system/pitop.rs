use anyhow::Context;
use tracing::{trace, warn};

use super::{Battery, Display};
use crate::{
    board::Board,
    component::{Component, Composite, Config},
    oled::Miniscreen,
};

pub(crate) const MODULE: &str = module_path!();

/// Root of a component tree, owning the parts built into the pi-top
#[derive(Debug)]
pub struct Pitop {
    battery: Battery,
    display: Display,
    miniscreen: Option<Miniscreen>,
    components: Composite,
}

impl Pitop {
    #[tracing::instrument(skip(board))]
    pub fn new(board: &Board) -> Self {
        trace!("Pitop::new()");

        let miniscreen = match Miniscreen::new(board) {
            Ok(miniscreen) => Some(miniscreen),
            Err(err) => {
                warn!("No miniscreen: {err:?}");
                None
            }
        };

        Self {
            battery: Battery::new(board),
            display: Display::new(board),
            miniscreen,
            components: Composite::new(),
        }
    }

    pub(crate) fn from_config(board: &Board, _config: &Config) -> anyhow::Result<Box<dyn Component>> {
        Ok(Box::new(Pitop::new(board)))
    }

    pub fn battery(&self) -> &Battery {
        &self.battery
    }

    pub fn display(&self) -> &Display {
        &self.display
    }

    /// Absent on hosts without a miniscreen
    pub fn miniscreen(&self) -> Option<&Miniscreen> {
        self.miniscreen.as_ref()
    }

    pub fn add_component(
        &mut self,
        component: Box<dyn Component>,
        name: Option<&str>,
    ) -> anyhow::Result<()> {
        let name = name.unwrap_or(component.name()).to_owned();
        if self.builtin().iter().any(|(builtin, _)| *builtin == name) {
            anyhow::bail!(common::error::SdkError::validation(format!(
                "{name:?} is reserved"
            )));
        }

        self.components
            .add_component(component, Some(&name))
            .with_context(|| format!("Add {name} to pitop"))
    }

    pub fn child(&self, name: &str) -> Option<&dyn Component> {
        self.children()
            .into_iter()
            .find(|(child, _)| *child == name)
            .map(|(_, component)| component)
    }

    fn builtin(&self) -> Vec<(&str, &dyn Component)> {
        let mut builtin: Vec<(&str, &dyn Component)> =
            vec![("battery", &self.battery), ("display", &self.display)];
        if let Some(miniscreen) = &self.miniscreen {
            builtin.push(("miniscreen", miniscreen));
        }

        builtin
    }
}

impl Component for Pitop {
    fn class_name(&self) -> &'static str {
        "Pitop"
    }

    fn module(&self) -> &'static str {
        MODULE
    }

    fn name(&self) -> &str {
        "pitop"
    }

    fn children(&self) -> Vec<(&str, &dyn Component)> {
        let mut children = self.builtin();
        children.extend(self.components.children());
        children
    }

    fn as_composite_mut(&mut self) -> Option<&mut Composite> {
        Some(&mut self.components)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        let res = self.components.close();

        self.battery.close()?;
        self.display.close()?;
        if let Some(miniscreen) = &mut self.miniscreen {
            Component::close(miniscreen)?;
        }

        res
    }
}
