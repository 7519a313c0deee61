use evalexpr::{ContextWithMutableVariables, HashMapContext, Node, Value};
use grafscrape_core::error::{Result, ScrapeError};
use grafscrape_core::model::point::Tags;

pub const VALUE_VAR: &str = "value";
pub const TS_VAR: &str = "ts";

#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    node: Node,
}

impl Expression {
    pub fn compile(source: &str) -> Result<Self> {
        let node = evalexpr::build_operator_tree(source)
            .map_err(|e| ScrapeError::Expression(format!("{source}: {e}")))?;
        Ok(Self {
            source: source.to_string(),
            node,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval_number(&self, ctx: &HashMapContext) -> Result<f64> {
        self.node
            .eval_with_context(ctx)
            .and_then(|v| v.as_number())
            .map_err(|e| ScrapeError::Expression(format!("{}: {e}", self.source)))
    }

    pub fn eval_text(&self, ctx: &HashMapContext) -> Result<String> {
        let value = self
            .node
            .eval_with_context(ctx)
            .map_err(|e| ScrapeError::Expression(format!("{}: {e}", self.source)))?;
        match value {
            Value::String(s) => Ok(s),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => Ok(f.to_string()),
            Value::Boolean(b) => Ok(b.to_string()),
            other => Err(ScrapeError::Expression(format!(
                "{}: cannot use {other} as a tag value",
                self.source
            ))),
        }
    }
}

// Tags become string variables; `value` and `ts` always refer to the point itself.
pub fn point_context(value: f64, ts_millis: i64, tags: &Tags) -> HashMapContext {
    let mut ctx = HashMapContext::new();
    for (name, tag) in tags {
        if name != VALUE_VAR && name != TS_VAR {
            let _ = ctx.set_value(name.clone(), Value::String(tag.clone()));
        }
    }
    let _ = ctx.set_value(VALUE_VAR.to_string(), Value::Float(value));
    let _ = ctx.set_value(TS_VAR.to_string(), Value::Int(ts_millis));
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_against_point_variables() {
        let mut tags = Tags::new();
        tags.insert("host".into(), "web-1".into());
        let ctx = point_context(2.5, 1_620_000_000_000, &tags);

        let scale = Expression::compile("value * 1000").unwrap();
        assert_eq!(scale.eval_number(&ctx).unwrap(), 2500.0);

        let label = Expression::compile(r#"host + "-a""#).unwrap();
        assert_eq!(label.eval_text(&ctx).unwrap(), "web-1-a");

        let int_result = Expression::compile("ts / 1000").unwrap();
        assert_eq!(int_result.eval_text(&ctx).unwrap(), "1620000000");
    }

    #[test]
    fn reports_compile_and_eval_errors() {
        assert!(matches!(
            Expression::compile("(value * 2").unwrap_err(),
            ScrapeError::Expression(_)
        ));

        let ctx = point_context(1.0, 0, &Tags::new());
        let missing = Expression::compile("missing * 2").unwrap();
        assert!(missing.eval_number(&ctx).is_err());
        let text = Expression::compile(r#""a""#).unwrap();
        assert!(text.eval_number(&ctx).is_err());
    }

    #[test]
    fn point_variables_shadow_tags() {
        let mut tags = Tags::new();
        tags.insert("value".into(), "shadow".into());
        let ctx = point_context(3.0, 0, &tags);
        let expr = Expression::compile("value + 1").unwrap();
        assert_eq!(expr.eval_number(&ctx).unwrap(), 4.0);
    }
}
