use promptline_prompt::PromptTemplate;
use serde::Serialize;
use serde_json::json;

#[test]
fn renders_template_with_vars() {
    let tmpl = PromptTemplate::new("Hello {{name}}");
    let rendered = tmpl.render(&json!({"name": "Ada"})).expect("render");
    assert_eq!(rendered, "Hello Ada");
}

#[test]
fn does_not_confuse_overlapping_keys() {
    let tmpl = PromptTemplate::new("{{name}} {{fullname}}");
    let rendered = tmpl.render(&json!({"name": "X", "fullname": "Y"})).expect("render");
    assert_eq!(rendered, "X Y");
}

#[test]
fn renders_property_paths_and_joins() {
    #[derive(Serialize)]
    struct Ticket {
        title: String,
        labels: Vec<String>,
        author: Author,
    }

    #[derive(Serialize)]
    struct Author {
        login: String,
    }

    let ticket = Ticket {
        title: "Crash on start".to_string(),
        labels: vec!["bug".to_string(), "p1".to_string()],
        author: Author {
            login: "octo".to_string(),
        },
    };
    let tmpl = PromptTemplate::new(
        "Title: {{ title }}\nLabels: {{labels.join(\", \")}}\nBy: {{author.login}}",
    );

    let rendered = tmpl
        .render(&serde_json::to_value(&ticket).unwrap())
        .expect("render");
    assert_eq!(rendered, "Title: Crash on start\nLabels: bug, p1\nBy: octo");
}

#[test]
fn whole_input_is_bound_as_input() {
    let tmpl = PromptTemplate::new("Summarize: {{input}}");
    assert_eq!(
        tmpl.render(&json!("some text")).expect("render"),
        "Summarize: some text"
    );
}

#[test]
fn unsupported_expression_falls_back_to_property_lookup() {
    let tmpl = PromptTemplate::new("[{{a + b}}] [{{missing.path}}]");
    let rendered = tmpl
        .render(&json!({"a + b": "literal key", "a": 1, "b": 2}))
        .expect("a bad expression degrades instead of failing the render");
    assert_eq!(rendered, "[literal key] []");
}

#[test]
fn non_string_values_render_as_json() {
    let tmpl = PromptTemplate::new("{{count}} {{flags}} {{nothing}}");
    let rendered = tmpl
        .render(&json!({"count": 3, "flags": [true], "nothing": null}))
        .expect("render");
    assert_eq!(rendered, "3 [true] ");
}

#[test]
fn lists_placeholders_in_order() {
    let tmpl = PromptTemplate::new("{{ b }} then {{a.c}}");
    assert_eq!(tmpl.placeholders().expect("placeholders"), vec!["b", "a.c"]);
}
