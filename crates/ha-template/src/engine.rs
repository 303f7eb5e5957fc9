//! Template engine for Home Assistant
//!
//! Provides Jinja2-compatible template rendering with Home Assistant-specific
//! functions and filters. Each render runs against a fresh recording
//! [`StatesObject`], so the returned [`RenderInfo`] lists exactly the state
//! that render read.

use crate::error::{TemplateError, TemplateResult};
use crate::filters;
use crate::globals;
use crate::render::{RenderInfo, TemplateRenderer, Variables};
use crate::states::{self, StatesObject};
use ha_state_store::StateStore;
use minijinja::{Environment, UndefinedBehavior, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Template engine with Home Assistant extensions
///
/// The engine provides:
/// - Access to entity states via the `states` object
/// - State functions like `is_state()`, `state_attr()`, `has_value()`, `expand()`
/// - `now()` / `utcnow()` read from the hub clock
/// - Filters like `round`, `regex_replace`, `to_json`, `int`, `float`
pub struct TemplateEngine {
    env: Environment<'static>,
    store: Arc<StateStore>,
}

impl TemplateEngine {
    /// Create a new template engine reading from the state store
    pub fn new(store: Arc<StateStore>) -> Self {
        let mut env = Environment::new();

        // `states.switch.missing.state` renders empty instead of failing
        env.set_undefined_behavior(UndefinedBehavior::Chainable);

        Self::register_filters(&mut env);
        Self::register_functions(&mut env);
        Self::register_tests(&mut env);

        Self { env, store }
    }

    fn register_filters(env: &mut Environment<'static>) {
        // String filters
        env.add_filter("regex_replace", filters::regex_replace);
        env.add_filter("regex_findall", filters::regex_findall);
        env.add_filter("regex_match", filters::regex_match);
        env.add_filter("regex_search", filters::regex_search);

        // Type conversion
        env.add_filter("float", filters::to_float);
        env.add_filter("int", filters::to_int);
        env.add_filter("bool", filters::to_bool);
        env.add_filter("is_number", filters::is_number);
        env.add_filter("contains", filters::contains);

        // Math
        env.add_filter("round", filters::round_filter);

        // JSON
        env.add_filter("to_json", filters::to_json);
        env.add_filter("from_json", filters::from_json);

        // States
        env.add_filter("expand", states::expand_fn);
    }

    fn register_functions(env: &mut Environment<'static>) {
        env.add_function("is_state", states::is_state_fn);
        env.add_function("state_attr", states::state_attr_fn);
        env.add_function("is_state_attr", states::is_state_attr_fn);
        env.add_function("has_value", states::has_value_fn);
        env.add_function("expand", states::expand_fn);

        env.add_function("now", globals::now);
        env.add_function("utcnow", globals::utcnow);
        env.add_function("iif", globals::iif);
    }

    fn register_tests(env: &mut Environment<'static>) {
        env.add_test("match", filters::regex_match);
        env.add_test("search", filters::regex_search);
        env.add_test("is_number", filters::is_number);
        env.add_test("contains", filters::contains);
    }

    /// Render a template, recording every state it reads
    pub fn render(&self, template: &str, variables: &Variables) -> RenderInfo {
        let states = StatesObject::new(self.store.clone());
        let result = self.render_with(&states, template, variables);
        let access = states.access();
        trace!(
            entities = access.entities.len(),
            domains = access.domains.len(),
            all_states = access.all_states,
            "Rendered template"
        );

        RenderInfo {
            result,
            entities: access.entities,
            domains: access.domains,
            all_states: access.all_states,
        }
    }

    fn render_with(
        &self,
        states: &StatesObject,
        template: &str,
        variables: &Variables,
    ) -> TemplateResult<String> {
        let mut context: BTreeMap<String, Value> = variables
            .iter()
            .map(|(key, value)| (key.clone(), Value::from_serialize(value)))
            .collect();
        context.insert("states".to_string(), Value::from_object(states.clone()));

        Ok(self
            .env
            .render_str(template, Value::from_object(context))?)
    }

    /// Check that a template compiles
    pub fn validate(&self, template: &str) -> TemplateResult<()> {
        let env = Environment::new();
        env.template_from_str(template)?;
        Ok(())
    }

    /// Check if a template string contains template syntax
    pub fn is_template(template: &str) -> bool {
        template.contains("{{") || template.contains("{%") || template.contains("{#")
    }

    /// The state store templates read from
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }
}

impl TemplateRenderer for TemplateEngine {
    fn render(&self, template: &str, variables: &Variables) -> RenderInfo {
        TemplateEngine::render(self, template, variables)
    }

    fn validate(&self, template: &str) -> Result<(), TemplateError> {
        TemplateEngine::validate(self, template)
    }
}
