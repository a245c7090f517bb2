//! Function signatures recovered from demangled Swift symbol names, e.g.
//! `main.Point.scaled(by: Swift.Double) -> main.Point`.

use crate::utils::split_top_level;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignatureKind {
    Function,
    Initializer,
    Getter,
    Setter,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Parameter {
    /// `None` for `_`.
    pub label: Option<String>,
    pub ty: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    /// The nominal type the function is declared in, e.g. `main.Point`.
    pub owner: Option<String>,
    pub name: String,
    pub parameters: Vec<Parameter>,
    /// `None` for `()`.
    pub result: Option<String>,
    pub throws: bool,
    pub is_static: bool,
    pub kind: SignatureKind,
}

impl MethodSignature {
    pub fn argument_types(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.ty.as_str()).collect()
    }

    /// Functions declared in a type take `self` (or the metatype) in the
    /// context register.
    pub fn has_context(&self) -> bool {
        self.owner.is_some()
    }

    /// The Swift selector, e.g. `scaled(by:)`.
    pub fn selector(&self) -> String {
        let labels: String = self
            .parameters
            .iter()
            .map(|p| format!("{}:", p.label.as_deref().unwrap_or("_")))
            .collect();
        format!("{}({labels})", self.name)
    }
}

impl Display for MethodSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(owner) = &self.owner {
            write!(f, "{owner}.")?;
        }
        write!(f, "{}", self.selector())?;
        if self.throws {
            write!(f, " throws")?;
        }
        write!(f, " -> {}", self.result.as_deref().unwrap_or("()"))
    }
}

const SWIFT_PREFIXES: [&str; 5] = ["$s", "_$s", "$S", "_$S", "_T0"];

pub fn is_swift_symbol(name: &str) -> bool {
    SWIFT_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn split_path(path: &str) -> Option<(Option<String>, String)> {
    let components = split_top_level(path, '.');
    let (name, rest) = components.split_last()?;
    if name.is_empty() || name.contains('<') {
        return None;
    }
    let owner = (rest.len() >= 2).then(|| rest.join("."));
    Some((owner, name.to_string()))
}

fn result_type(ty: &str) -> Option<String> {
    match ty.trim() {
        "" | "()" | "Swift.Void" => None,
        ty => Some(ty.to_string()),
    }
}

/// Parses `[static ]path(label: Type, ...)[ async][ throws] -> Result`.
pub fn parse_method_signature(demangled: &str) -> Option<MethodSignature> {
    let demangled = demangled.trim();
    let (is_static, demangled) = match demangled.strip_prefix("static ") {
        Some(rest) => (true, rest),
        None => (false, demangled),
    };
    let open = demangled.find('(')?;
    let (owner, name) = split_path(&demangled[..open])?;

    let mut depth = 0;
    let mut close = None;
    for (i, c) in demangled[open..].char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(open + i);
                    break;
                }
            }
            _ => {}
        }
    }
    let close = close?;

    let inner = demangled[open + 1..close].trim();
    let parameters = if inner.is_empty() {
        vec![]
    } else {
        split_top_level(inner, ',')
            .into_iter()
            .map(|p| {
                // unlabeled parameters print as bare types
                let (label, ty) = match split_top_level(p, ':').as_slice() {
                    [label, ty] => (*label, *ty),
                    [ty] => ("_", *ty),
                    _ => return None,
                };
                Some(Parameter {
                    label: (label != "_").then(|| label.to_string()),
                    ty: ty.strip_prefix("__owned ").unwrap_or(ty).to_string(),
                })
            })
            .collect::<Option<Vec<_>>>()?
    };

    let mut rest = demangled[close + 1..].trim();
    if let Some(r) = rest.strip_prefix("async") {
        rest = r.trim_start();
    }
    let throws = match rest.strip_prefix("throws") {
        Some(r) => {
            rest = r.trim_start();
            true
        }
        None => false,
    };
    let result = match rest.strip_prefix("->") {
        Some(ty) => result_type(ty),
        None if rest.is_empty() => None,
        None => return None,
    };

    let kind = if name == "init" {
        SignatureKind::Initializer
    } else {
        SignatureKind::Function
    };
    Some(MethodSignature {
        owner,
        name,
        parameters,
        result,
        throws,
        is_static,
        kind,
    })
}

/// Parses `path.member.getter : Type` and `path.member.setter : Type`.
pub fn parse_accessor_signature(demangled: &str) -> Option<MethodSignature> {
    let demangled = demangled.trim();
    let (is_static, demangled) = match demangled.strip_prefix("static ") {
        Some(rest) => (true, rest),
        None => (false, demangled),
    };
    let (path, ty) = demangled.split_once(" : ")?;
    let (path, kind) = if let Some(path) = path.strip_suffix(".getter") {
        (path, SignatureKind::Getter)
    } else if let Some(path) = path.strip_suffix(".setter") {
        (path, SignatureKind::Setter)
    } else {
        return None;
    };
    let (owner, name) = split_path(path)?;
    let ty = ty.trim().to_string();
    let (parameters, result) = match kind {
        SignatureKind::Setter => (
            vec![Parameter {
                label: None,
                ty,
            }],
            None,
        ),
        _ => (vec![], result_type(&ty)),
    };
    Some(MethodSignature {
        owner,
        name,
        parameters,
        result,
        throws: false,
        is_static,
        kind,
    })
}

pub fn parse_signature(demangled: &str) -> Option<MethodSignature> {
    parse_accessor_signature(demangled).or_else(|| parse_method_signature(demangled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_method() {
        let sig = parse_method_signature("main.Point.scaled(by: Swift.Double) -> main.Point").unwrap();
        assert_eq!(sig.owner.as_deref(), Some("main.Point"));
        assert_eq!(sig.name, "scaled");
        assert_eq!(
            sig.parameters,
            vec![Parameter {
                label: Some("by".into()),
                ty: "Swift.Double".into()
            }]
        );
        assert_eq!(sig.result.as_deref(), Some("main.Point"));
        assert_eq!(sig.kind, SignatureKind::Function);
        assert!(sig.has_context());
        assert_eq!(sig.to_string(), "main.Point.scaled(by:) -> main.Point");
    }

    #[test]
    fn test_free_function() {
        let sig = parse_method_signature(
            "main.apply(_: (Swift.Int) -> Swift.Int, to: [Swift.String : Swift.Int]) throws -> ()",
        )
        .unwrap();
        assert_eq!(sig.owner, None);
        assert_eq!(sig.argument_types(), vec!["(Swift.Int) -> Swift.Int", "[Swift.String : Swift.Int]"]);
        assert_eq!(sig.selector(), "apply(_:to:)");
        assert!(sig.throws);
        assert_eq!(sig.result, None);

        let bare = parse_method_signature("main.add(Swift.Int, Swift.Int) -> Swift.Int").unwrap();
        assert_eq!(bare.selector(), "add(_:_:)");
        assert_eq!(bare.argument_types(), vec!["Swift.Int", "Swift.Int"]);
    }

    #[test]
    fn test_initializer() {
        let sig = parse_method_signature(
            "static main.Circle.init(radius: Swift.Double) -> main.Circle",
        )
        .unwrap();
        assert!(sig.is_static);
        assert_eq!(sig.kind, SignatureKind::Initializer);
        assert_eq!(parse_method_signature("main.f<A>(a: A) -> A"), None);
        assert_eq!(parse_method_signature("main.Point.x.getter : Swift.Double"), None);
    }

    #[test]
    fn test_accessors() {
        let getter = parse_signature("main.Point.x.getter : Swift.Double").unwrap();
        assert_eq!(getter.kind, SignatureKind::Getter);
        assert_eq!(getter.owner.as_deref(), Some("main.Point"));
        assert_eq!(getter.result.as_deref(), Some("Swift.Double"));

        let setter = parse_signature("main.counter.setter : Swift.Int").unwrap();
        assert_eq!(setter.kind, SignatureKind::Setter);
        assert_eq!(setter.owner, None);
        assert_eq!(setter.argument_types(), vec!["Swift.Int"]);
        assert_eq!(setter.result, None);
    }

    #[test]
    fn test_swift_prefixes() {
        assert!(is_swift_symbol("$s4main5PointV1xSdvg"));
        assert!(is_swift_symbol("_$s4main5PointV1xSdvg"));
        assert!(!is_swift_symbol("malloc"));
    }
}
