//! Harness compositor: turns an answer plus a test spec into one runnable
//! program per language family.
//!
//! Every transformation is data: placeholder snippets for the text family and
//! an ordered rewrite table for the problem family, so each rule can be
//! checked without running anything.

use crate::spec::strip_embedded_tests;
use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

pub const HEADER_PLACEHOLDER: &str = "[[[header]]]";
pub const CODE_PLACEHOLDER: &str = "[[[code]]]";
pub const FOOTER_PLACEHOLDER: &str = "[[[footer]]]";

/// Placeholder snippets for a line-oriented text language.
///
/// `header` silences the output/input primitives, `footer` restores them, so
/// the answer body runs quietly while assertion output still reaches stdout.
#[derive(Debug, Clone, Copy)]
pub struct TextHarness {
    pub header: &'static str,
    pub footer: &'static str,
}

pub const PYTHON_HARNESS: TextHarness = TextHarness {
    header: "import builtins as _grader_builtins\n\
             _grader_print, _grader_input = _grader_builtins.print, _grader_builtins.input\n\
             _grader_builtins.print = lambda *args, **kwargs: None\n\
             _grader_builtins.input = lambda *args, **kwargs: ''\n",
    footer: "_grader_builtins.print, _grader_builtins.input = _grader_print, _grader_input\n",
};

/// Languages without output/input primitives to silence
pub const PLAIN_HARNESS: TextHarness = TextHarness { header: "", footer: "" };

pub fn text_harness(language: &str) -> TextHarness {
    match language.to_lowercase().as_str() {
        "python" => PYTHON_HARNESS,
        _ => PLAIN_HARNESS,
    }
}

/// Template used when a testcode blob has no `[[[code]]]`: the blob becomes
/// the footer part.
pub fn default_testcode_template(blob: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        HEADER_PLACEHOLDER, CODE_PLACEHOLDER, FOOTER_PLACEHOLDER, blob
    )
}

impl TextHarness {
    pub fn compose_testcode(&self, template: &str, answer: &str) -> String {
        let answer = strip_embedded_tests(answer);
        let template: Cow<'_, str> = if template.contains(CODE_PLACEHOLDER) {
            Cow::Borrowed(template)
        } else {
            Cow::Owned(default_testcode_template(template))
        };

        // Code goes in last so placeholder text inside the answer stays literal.
        template
            .replace(HEADER_PLACEHOLDER, self.header)
            .replace(FOOTER_PLACEHOLDER, self.footer)
            .replace(CODE_PLACEHOLDER, answer)
    }
}

/// Source for a testcases run: the answer, optionally placed in a run template.
/// A template without `[[[code]]]` is appended after the answer.
pub fn compose_run_template(run_template: Option<&str>, answer: &str) -> String {
    match run_template {
        None => answer.to_string(),
        Some(template) if template.contains(CODE_PLACEHOLDER) => template.replace(CODE_PLACEHOLDER, answer),
        Some(template) => format!("{}\n{}", answer, template),
    }
}

/// One rule of the problem-family rewrite table
#[derive(Debug, Clone, Copy)]
pub enum Rewrite {
    /// Multi-line regex replacement
    Pattern {
        pattern: &'static str,
        replacement: &'static str,
    },
    Literal {
        from: &'static str,
        to: &'static str,
    },
    /// Comment out every line whose first non-blank text starts with `prefix`
    CommentOutPrefix { prefix: &'static str },
}

/// Identifier the stage model is bound to inside the harness
pub const MODEL_BINDING: &str = "_stageModel";

/// Applied in order to problem-family answers.
pub const PROBLEM_REWRITES: &[Rewrite] = &[
    // Editor prompts that only make sense in the browser chat panel.
    Rewrite::Pattern {
        pattern: r"(?m)^.*window\.chatManager\.addMessage.*Digite um .* para guardar como.*$",
        replacement: "",
    },
    Rewrite::Pattern {
        pattern: r"window\.chatManager\.addMessage\((.+), 'received'\);",
        replacement: "console.log(${1});",
    },
    Rewrite::Literal {
        from: "prompt(",
        to: "await prompt(",
    },
    Rewrite::Literal {
        from: "await window.stageManager",
        to: MODEL_BINDING,
    },
    Rewrite::Literal {
        from: "window.stageManager",
        to: MODEL_BINDING,
    },
    Rewrite::Literal {
        from: "window.chatManager",
        to: "// window.chatManager",
    },
    // The harness cannot emulate UI waits (animations, delays).
    Rewrite::CommentOutPrefix { prefix: "await" },
];

enum CompiledRewrite {
    Pattern(Regex, &'static str),
    Literal(&'static str, &'static str),
    CommentOutPrefix(&'static str),
}

lazy_static! {
    static ref COMPILED_PROBLEM_REWRITES: Vec<CompiledRewrite> = PROBLEM_REWRITES
        .iter()
        .map(|rule| match *rule {
            Rewrite::Pattern { pattern, replacement } => {
                CompiledRewrite::Pattern(Regex::new(pattern).unwrap(), replacement)
            }
            Rewrite::Literal { from, to } => CompiledRewrite::Literal(from, to),
            Rewrite::CommentOutPrefix { prefix } => CompiledRewrite::CommentOutPrefix(prefix),
        })
        .collect();
}

pub fn apply_problem_rewrites(code: &str) -> String {
    let mut code = code.to_string();
    for rule in COMPILED_PROBLEM_REWRITES.iter() {
        code = match rule {
            CompiledRewrite::Pattern(regex, replacement) => regex.replace_all(&code, *replacement).into_owned(),
            CompiledRewrite::Literal(from, to) => code.replace(from, to),
            CompiledRewrite::CommentOutPrefix(prefix) => code
                .split('\n')
                .map(|line| {
                    if line.trim_start().starts_with(prefix) {
                        format!("// {}", line)
                    } else {
                        line.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
        };
    }
    code
}

/// Simulated environment a problem stage runs against
#[derive(Debug)]
pub struct StageModel {
    pub stage_type: &'static str,
    pub class_name: &'static str,
    pub source: &'static str,
}

pub const STAGE_MODELS: &[StageModel] = &[StageModel {
    stage_type: "cleaning",
    class_name: "CleaningModel",
    source: include_str!("../assets/stages/cleaning.js"),
}];

pub fn stage_model(stage_type: Option<&str>) -> Option<&'static StageModel> {
    let stage_type = stage_type?;
    STAGE_MODELS.iter().find(|model| model.stage_type == stage_type)
}

/// Line-buffered input: `prompt()` suspends until one stdin line arrives and
/// yields `null` at end of input. Problem runs always send at least one line.
const PROBLEM_PRELUDE: &str = r#"const readline = require('readline');

const _inputInterface = readline.createInterface({ input: process.stdin, terminal: false });
const _inputLines = _inputInterface[Symbol.asyncIterator]();

async function prompt() {
  const next = await _inputLines.next();
  return next.done ? null : next.value;
}
"#;

/// Answers saved by the block editor are `{"code": {"javascript": "..."}}`.
pub fn extract_javascript(answer: &str) -> Cow<'_, str> {
    let parsed: Option<String> = serde_json::from_str::<serde_json::Value>(answer)
        .ok()
        .and_then(|value| value.pointer("/code/javascript")?.as_str().map(str::to_string));
    match parsed {
        Some(code) => Cow::Owned(code),
        None => Cow::Borrowed(answer),
    }
}

/// Compose a problem-family program.
///
/// With a stage model, the program ends by printing a blank line and then the
/// model's `outcome()` as a single JSON line.
pub fn compose_problem(answer: &str, stage_type: Option<&str>, data: &serde_json::Value) -> String {
    let code = apply_problem_rewrites(&extract_javascript(answer));
    let model = stage_model(stage_type);

    let mut program = String::from(PROBLEM_PRELUDE);
    if let Some(model) = model {
        program.push('\n');
        program.push_str(model.source);
        program.push('\n');
    }

    program.push_str("\nasync function main() {\n");
    if let Some(model) = model {
        let data_json = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
        program.push_str(&format!("const {} = new {}({});\n", MODEL_BINDING, model.class_name, data_json));
    }
    program.push_str(&code);
    program.push('\n');
    if model.is_some() {
        program.push_str("console.log('');\n");
        program.push_str(&format!("console.log(JSON.stringify({}.outcome()));\n", MODEL_BINDING));
    }
    program.push_str("}\n\n");
    program.push_str(
        "main()\n  .catch((err) => console.log(String((err && err.stack) || err)))\n  .finally(() => _inputInterface.close());\n",
    );
    program
}
