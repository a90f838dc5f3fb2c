use anyhow::{bail, Result};
use std::str::FromStr;

/// Operación sobre una línea.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOp {
    Prefix(String),
    Suffix(String),
    Upper,
    Lower,
    Trim,
}

impl LineOp {
    fn apply(&self, line: String) -> String {
        match self {
            LineOp::Prefix(p) => format!("{}{}", p, line),
            LineOp::Suffix(s) => format!("{}{}", line, s),
            LineOp::Upper => line.to_uppercase(),
            LineOp::Lower => line.to_lowercase(),
            LineOp::Trim => line.trim().to_string(),
        }
    }
}

/// Transformación aplicada a cada línea no vacía, en orden.
///
/// Se escribe como texto: `"upper|prefix=Hello! "`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTransform {
    ops: Vec<LineOp>,
}

pub const DEFAULT_GREETING: &str = "Hello! ";

impl Default for LineTransform {
    fn default() -> Self {
        Self {
            ops: vec![LineOp::Prefix(DEFAULT_GREETING.to_string())],
        }
    }
}

impl LineTransform {
    pub fn new(ops: Vec<LineOp>) -> Self {
        Self { ops }
    }

    pub fn apply(&self, line: &str) -> String {
        self.ops
            .iter()
            .fold(line.to_string(), |acc, op| op.apply(acc))
    }
}

impl FromStr for LineTransform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut ops = Vec::new();
        for raw in s.split('|') {
            // no recortamos el argumento: "prefix=Hello! " lleva espacio
            let op = match raw.split_once('=') {
                Some(("prefix", arg)) => LineOp::Prefix(arg.to_string()),
                Some(("suffix", arg)) => LineOp::Suffix(arg.to_string()),
                None => match raw.trim() {
                    "upper" => LineOp::Upper,
                    "lower" => LineOp::Lower,
                    "trim" => LineOp::Trim,
                    "" => continue,
                    other => bail!("operación de línea desconocida: {other}"),
                },
                Some((other, _)) => bail!("operación de línea desconocida: {other}"),
            };
            ops.push(op);
        }
        Ok(Self { ops })
    }
}
