/// Template rendering on top of handlebars. One engine per service,
/// serialized behind a mutex so helper registration stays coherent
/// with in-flight renders (subject and body always render under the
/// same guard).
use crate::errors::{DispatchError, DispatchResult};
use crate::payload::keys;
use handlebars::{
    no_escape, Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
};
use parking_lot::Mutex;
use serde_json::Value;

/// Built-in `secure_link` helper: `{{secure_link}}` reads the action
/// URL key from the render data, `{{secure_link "manifest_url"}}`
/// reads an explicit key. Action requests fall back to the generic
/// URL key; absence renders as an empty string.
fn secure_link_helper(
    h: &Helper,
    _: &Handlebars,
    ctx: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let key = h
        .param(0)
        .and_then(|p| p.value().as_str())
        .unwrap_or(keys::ACTION_URL);

    let root = ctx.data().as_object();
    let lookup = |k: &str| -> Option<String> {
        root.and_then(|m| m.get(k))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let mut resolved = lookup(key);
    if resolved.is_none() && key == keys::ACTION_URL {
        resolved = lookup(keys::URL);
    }

    out.write(resolved.as_deref().unwrap_or(""))?;
    Ok(())
}

/// The renderer proper. Template strings are evaluated ad hoc against
/// a data tree; nothing is pre-compiled because variants change at
/// runtime.
pub struct TemplateRenderer {
    engine: Mutex<Handlebars<'static>>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut engine = Handlebars::new();
        // Bodies go out over non-HTML channels too; the variant's
        // format field decides presentation, not the renderer.
        engine.register_escape_fn(no_escape);
        engine.register_helper("secure_link", Box::new(secure_link_helper));
        Self {
            engine: Mutex::new(engine),
        }
    }

    /// Register a helper visible to all subsequent renders.
    pub fn register_helper(&self, name: &str, helper: Box<dyn HelperDef + Send + Sync>) {
        self.engine.lock().register_helper(name, helper);
    }

    /// Render a subject/body pair under one lock acquisition.
    pub fn render_pair(
        &self,
        subject: &str,
        body: &str,
        data: &Value,
    ) -> DispatchResult<(String, String)> {
        let engine = self.engine.lock();
        let subject = engine
            .render_template(subject, data)
            .map_err(|e| DispatchError::RenderFailed(e.to_string()))?;
        let body = engine
            .render_template(body, data)
            .map_err(|e| DispatchError::RenderFailed(e.to_string()))?;
        Ok((subject, body))
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_placeholders_without_escaping() {
        let renderer = TemplateRenderer::new();
        let data = json!({ "name": "Rosa & Co", "amount": 10 });
        let (subject, body) = renderer
            .render_pair("Hi {{name}}", "You owe {{amount}}", &data)
            .unwrap();
        assert_eq!(subject, "Hi Rosa & Co");
        assert_eq!(body, "You owe 10");
    }

    #[test]
    fn secure_link_reads_action_url_with_generic_fallback() {
        let renderer = TemplateRenderer::new();

        let data = json!({ "action_url": "https://a.example/x" });
        let (_, body) = renderer
            .render_pair("s", "{{secure_link}}", &data)
            .unwrap();
        assert_eq!(body, "https://a.example/x");

        // Action request falls back to the generic URL key.
        let data = json!({ "url": "https://g.example/y" });
        let (_, body) = renderer
            .render_pair("s", "{{secure_link}}", &data)
            .unwrap();
        assert_eq!(body, "https://g.example/y");

        // Explicit key, no fallback.
        let data = json!({ "manifest_url": "https://m.example/z" });
        let (_, body) = renderer
            .render_pair("s", "{{secure_link \"manifest_url\"}}", &data)
            .unwrap();
        assert_eq!(body, "https://m.example/z");

        let (_, body) = renderer
            .render_pair("s", "{{secure_link \"manifest_url\"}}", &json!({}))
            .unwrap();
        assert_eq!(body, "");
    }

    #[test]
    fn registered_helpers_are_visible_to_later_renders() {
        fn shout(
            h: &Helper,
            _: &Handlebars,
            _: &Context,
            _: &mut RenderContext,
            out: &mut dyn Output,
        ) -> HelperResult {
            let text = h.param(0).and_then(|p| p.value().as_str()).unwrap_or("");
            out.write(&text.to_uppercase())?;
            Ok(())
        }

        let renderer = TemplateRenderer::new();
        renderer.register_helper("shout", Box::new(shout));
        let (_, body) = renderer
            .render_pair("s", "{{shout name}}", &json!({ "name": "rosa" }))
            .unwrap();
        assert_eq!(body, "ROSA");
    }

    #[test]
    fn render_errors_surface_as_render_failed() {
        let renderer = TemplateRenderer::new();
        let err = renderer
            .render_pair("{{#if}}", "body", &json!({}))
            .unwrap_err();
        assert!(matches!(err, DispatchError::RenderFailed(_)));
    }
}
