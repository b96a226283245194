//! `${name}` placeholder substitution.

use checkflow_types::value::{Value, Variables};

/// Replace every `${name}` placeholder with the literal form of the variable.
///
/// Dotted names (`${build.target}`) walk into object values. A missing
/// variable becomes `undefined`. An unterminated `${` is left untouched.
pub fn substitute_variables(expression: &str, context: &Variables) -> String {
    replace_placeholders(expression, context, Value::to_literal)
}

/// Like [`substitute_variables`], but strings are inserted unquoted.
///
/// Used for free text such as file paths, where the expression literal
/// form would add quotes.
pub fn interpolate_text(text: &str, context: &Variables) -> String {
    replace_placeholders(text, context, |value| value.to_string())
}

fn replace_placeholders(
    input: &str,
    context: &Variables,
    render: impl Fn(&Value) -> String,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = after[..end].trim();
                out.push_str(&render(&lookup(name, context)));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

fn lookup(name: &str, context: &Variables) -> Value {
    if let Some(value) = context.get(name) {
        return value.clone();
    }
    let mut segments = name.split('.');
    let Some(root) = segments.next().and_then(|head| context.get(head)) else {
        return Value::Undefined;
    };
    let path: Vec<&str> = segments.collect();
    if path.is_empty() {
        return Value::Undefined;
    }
    root.get_path(&path).cloned().unwrap_or(Value::Undefined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ctx(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn substitutes_scalars() {
        let vars = ctx(&[("x", Value::from(5)), ("flag", Value::from(true))]);
        assert_eq!(substitute_variables("${x} === 5", &vars), "5 === 5");
        assert_eq!(substitute_variables("!${flag}", &vars), "!true");
    }

    #[test]
    fn strings_are_quoted_and_escaped() {
        let vars = ctx(&[("name", Value::from("a\" || true || \"b"))]);
        let out = substitute_variables("${name} === 'x'", &vars);
        assert_eq!(out, r#""a\" || true || \"b" === 'x'"#);
    }

    #[test]
    fn missing_variable_is_undefined() {
        assert_eq!(substitute_variables("${nope}", &Variables::new()), "undefined");
    }

    #[test]
    fn dotted_path_walks_objects() {
        let mut build = BTreeMap::new();
        build.insert("target".to_string(), Value::from("release"));
        let vars = ctx(&[("build", Value::Object(build))]);
        assert_eq!(
            substitute_variables("${build.target} === \"release\"", &vars),
            "\"release\" === \"release\""
        );
        assert_eq!(substitute_variables("${build.missing}", &vars), "undefined");
    }

    #[test]
    fn unterminated_placeholder_is_left_alone() {
        let vars = ctx(&[("x", Value::from(1))]);
        assert_eq!(substitute_variables("${x} && ${y", &vars), "1 && ${y");
    }

    #[test]
    fn interpolate_text_leaves_strings_unquoted() {
        let vars = ctx(&[("dir", Value::from("target/release")), ("n", Value::from(2))]);
        assert_eq!(
            interpolate_text("${dir}/app-${n}.bin", &vars),
            "target/release/app-2.bin"
        );
        assert_eq!(interpolate_text("${nope}.txt", &vars), "undefined.txt");
    }

    #[test]
    fn whitespace_inside_braces_is_ignored() {
        let vars = ctx(&[("x", Value::from(2))]);
        assert_eq!(substitute_variables("${ x } > 1", &vars), "2 > 1");
    }
}
