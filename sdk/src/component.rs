//! Runtime composition of components
//!
//! Every component reports its own state and the config it was built from. Composites
//! add their children's state and config under the child's name, and the [`Registry`]
//! rebuilds a component tree from such a config.

use std::{collections::HashMap, fmt::Debug};

use anyhow::{bail, Context};
use common::error::{LogErrorExt, SdkError};
use serde_json::{Map, Value};
use tracing::{debug, error, trace};

use crate::board::Board;

pub type StateMap = Map<String, Value>;
pub type Config = Map<String, Value>;

pub const CLASSNAME_KEY: &str = "classname";
pub const MODULE_KEY: &str = "module";
pub const COMPONENTS_KEY: &str = "components";

pub trait Component: Send + Debug {
    fn class_name(&self) -> &'static str;
    fn module(&self) -> &'static str;
    fn name(&self) -> &str;

    /// Observable properties of this component, excluding its children
    fn own_state(&self) -> StateMap {
        StateMap::new()
    }

    /// Arguments needed to build this component again
    fn user_config(&self) -> Config {
        Config::new()
    }

    fn children(&self) -> Vec<(&str, &dyn Component)> {
        Vec::new()
    }

    /// Set for components that accept user added children
    fn as_composite_mut(&mut self) -> Option<&mut Composite> {
        None
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn state(&self) -> StateMap {
        let mut state = self.own_state();
        for (name, child) in self.children() {
            state.insert(name.to_owned(), Value::Object(child.state()));
        }

        state
    }

    fn config(&self) -> Config {
        let mut config = Config::new();
        config.insert(CLASSNAME_KEY.to_owned(), self.class_name().into());
        config.insert(MODULE_KEY.to_owned(), self.module().into());
        config.extend(self.user_config());

        let children = self.children();
        if !children.is_empty() {
            let components = children
                .into_iter()
                .map(|(name, child)| (name.to_owned(), Value::Object(child.config())))
                .collect();
            config.insert(COMPONENTS_KEY.to_owned(), Value::Object(components));
        }

        config
    }
}

/// Named children owned by a parent component
#[derive(Debug, Default)]
pub struct Composite {
    children: Vec<(String, Box<dyn Component>)>,
}

impl Composite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `component`, named `name` or the component's own name
    pub fn add_component(
        &mut self,
        component: Box<dyn Component>,
        name: Option<&str>,
    ) -> anyhow::Result<()> {
        let name = match name {
            Some(name) => name,
            None => component.name(),
        };

        if name.is_empty() {
            bail!(SdkError::validation(format!(
                "A name is required to add a {}",
                component.class_name()
            )));
        }
        if self.child(name).is_some() {
            bail!(SdkError::validation(format!(
                "A component named {name:?} already exists"
            )));
        }

        debug!("Adding {} as {name:?}", component.class_name());
        let name = name.to_owned();
        self.children.push((name, component));

        Ok(())
    }

    pub fn child(&self, name: &str) -> Option<&dyn Component> {
        self.children
            .iter()
            .find(|(child, _)| child == name)
            .map(|(_, component)| component.as_ref())
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut (dyn Component + 'static)> {
        self.children
            .iter_mut()
            .find(|(child, _)| child == name)
            .map(|(_, component)| component.as_mut())
    }

    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Component>> {
        let idx = self.children.iter().position(|(child, _)| child == name)?;
        Some(self.children.remove(idx).1)
    }

    pub fn children(&self) -> Vec<(&str, &dyn Component)> {
        self.children
            .iter()
            .map(|(name, component)| (name.as_str(), component.as_ref()))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Closes every child, reporting the first failure after trying all of them
    pub fn close(&mut self) -> anyhow::Result<()> {
        let mut first_error = None;

        for (name, child) in self.children.iter_mut().rev() {
            if let Err(err) = child.close() {
                error!("Could not close {name}: {err:?}");
                first_error.get_or_insert(err.context(format!("Close {name}")));
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A plain container for user components
#[derive(Debug)]
pub struct Group {
    name: String,
    components: Composite,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Composite::new(),
        }
    }

    pub fn add_component(
        &mut self,
        component: Box<dyn Component>,
        name: Option<&str>,
    ) -> anyhow::Result<()> {
        self.components.add_component(component, name)
    }

    pub fn child(&self, name: &str) -> Option<&dyn Component> {
        self.components.child(name)
    }

    fn from_config(_board: &Board, config: &Config) -> anyhow::Result<Box<dyn Component>> {
        Ok(Box::new(Group::new(config_str(config, "name")?)))
    }
}

impl Component for Group {
    fn class_name(&self) -> &'static str {
        "Group"
    }

    fn module(&self) -> &'static str {
        module_path!()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn user_config(&self) -> Config {
        let mut config = Config::new();
        config.insert("name".to_owned(), self.name.clone().into());
        config
    }

    fn children(&self) -> Vec<(&str, &dyn Component)> {
        self.components.children()
    }

    fn as_composite_mut(&mut self) -> Option<&mut Composite> {
        Some(&mut self.components)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.components.close()
    }
}

pub type Constructor = fn(&Board, &Config) -> anyhow::Result<Box<dyn Component>>;

/// Constructors keyed by `(module, classname)`
#[derive(Debug, Default, Clone)]
pub struct Registry {
    constructors: HashMap<(String, String), Constructor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry knowing every component shipped with the sdk
    pub fn with_builtin() -> Self {
        let mut registry = Registry::new();

        registry.register(module_path!(), "Group", Group::from_config);
        crate::digital::register(&mut registry);
        crate::adc::register(&mut registry);
        crate::ultrasonic::register(&mut registry);
        crate::motor::register(&mut registry);
        crate::servo::register(&mut registry);
        crate::robotics::register(&mut registry);
        crate::system::register(&mut registry);

        registry
    }

    pub fn register(&mut self, module: &str, class_name: &str, constructor: Constructor) {
        trace!("Registering {module}::{class_name}");
        self.constructors
            .insert((module.to_owned(), class_name.to_owned()), constructor);
    }

    pub fn contains(&self, module: &str, class_name: &str) -> bool {
        self.constructors
            .contains_key(&(module.to_owned(), class_name.to_owned()))
    }

    /// Rebuilds a component and every child listed in its config
    ///
    /// Children that fail to build are logged and skipped. Children the parent already
    /// built for itself are kept as built.
    pub fn from_config(&self, board: &Board, config: &Config) -> anyhow::Result<Box<dyn Component>> {
        let module = config_str(config, MODULE_KEY)?;
        let class_name = config_str(config, CLASSNAME_KEY)?;

        let constructor = self
            .constructors
            .get(&(module.to_owned(), class_name.to_owned()))
            .ok_or_else(|| {
                SdkError::Reconstruction(format!("No component {class_name} in {module}"))
            })?;

        let mut component =
            constructor(board, config).with_context(|| format!("Build {class_name}"))?;

        let Some(children) = config.get(COMPONENTS_KEY).and_then(Value::as_object) else {
            return Ok(component);
        };

        let built: Vec<String> = component
            .children()
            .into_iter()
            .map(|(name, _)| name.to_owned())
            .collect();

        if let Some(composite) = component.as_composite_mut() {
            for (name, child_config) in children {
                if built.iter().any(|built| built == name) {
                    continue;
                }

                let Some(child_config) = child_config.as_object() else {
                    error!("Config of child {name} is not an object");
                    continue;
                };

                let res = self
                    .from_config(board, child_config)
                    .and_then(|child| composite.add_component(child, Some(name)));
                res.log_error(&format!("Could not rebuild child {name}"));
            }
        }

        Ok(component)
    }
}

/// Reads a string field of a component config
pub fn config_str<'a>(config: &'a Config, key: &str) -> anyhow::Result<&'a str> {
    config.get(key).and_then(Value::as_str).ok_or_else(|| {
        SdkError::Reconstruction(format!("Config is missing the string field {key:?}")).into()
    })
}

pub fn config_f64(config: &Config, key: &str) -> anyhow::Result<f64> {
    config.get(key).and_then(Value::as_f64).ok_or_else(|| {
        SdkError::Reconstruction(format!("Config is missing the number field {key:?}")).into()
    })
}

pub fn config_usize(config: &Config, key: &str) -> anyhow::Result<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|value| usize::try_from(value).ok())
        .ok_or_else(|| {
            SdkError::Reconstruction(format!("Config is missing the count field {key:?}")).into()
        })
}

pub fn config_bool(config: &Config, key: &str) -> anyhow::Result<bool> {
    config.get(key).and_then(Value::as_bool).ok_or_else(|| {
        SdkError::Reconstruction(format!("Config is missing the flag field {key:?}")).into()
    })
}
