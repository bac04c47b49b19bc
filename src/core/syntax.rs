//! Statement lines and header values of the transaction log.
//!
//! A statement line is the N-Quads form of the statement: `<s> <p> <o> [<g>] .`, with the graph
//! omitted for the default graph. Formatting and parsing go through oxigraph; only the escaping
//! of header values is done here.

use oxigraph::io::{RdfFormat, RdfParser};
use oxigraph::model::{Quad, Term};

use crate::core::Statement;
use crate::error::{Error, Result};

pub fn to_quad(statement: &Statement) -> Quad {
    Quad::new(
        statement.subject.clone(),
        statement.predicate.clone(),
        statement.object.clone(),
        statement.graph.clone(),
    )
}

pub fn format_statement(statement: &Statement) -> String {
    format!("{} .", to_quad(statement))
}

/// Parse exactly one N-Quads statement whose subject is an IRI
pub fn parse_statement(line: &str) -> Result<Statement> {
    let mut quads = RdfParser::from_format(RdfFormat::NQuads).for_reader(line.as_bytes());
    let quad = quads
        .next()
        .ok_or_else(|| Error::Parse(format!("No statement in: {}", line)))?
        .map_err(|e| Error::Parse(format!("Invalid statement '{}': {}", line, e)))?;
    if quads.next().is_some() {
        return Err(Error::Parse(format!("More than one statement in: {}", line)));
    }
    let subject = match Term::from(quad.subject) {
        Term::NamedNode(node) => node,
        _ => return Err(Error::Parse(format!("Expected an IRI subject in: {}", line))),
    };
    Ok(Statement::new(subject, quad.predicate, quad.object, quad.graph_name))
}

/// Escape a header value so it stays on one line
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let decoded = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32);
                out.push(decoded.ok_or_else(|| Error::Parse(format!("Invalid escape \\u{} in: {}", hex, value)))?);
            }
            other => {
                return Err(Error::Parse(format!("Invalid escape \\{} in: {}", other.unwrap_or(' '), value)));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vocab;
    use oxigraph::model::{GraphName, Literal, NamedNode};

    fn iri(value: &str) -> NamedNode {
        NamedNode::new(value).unwrap()
    }

    #[test]
    fn test_parse_statement_in_named_graph() {
        let line = "<http://example.org/s> <http://example.org/p> \"23.5\"^^<http://www.w3.org/2001/XMLSchema#decimal> <http://example.org/g> .";
        let statement = parse_statement(line).unwrap();
        assert_eq!(statement.subject, iri("http://example.org/s"));
        assert_eq!(statement.graph, GraphName::NamedNode(iri("http://example.org/g")));
        match &statement.object {
            Term::Literal(literal) => {
                assert_eq!(literal.value(), "23.5");
                assert_eq!(literal.datatype().as_str(), vocab::XSD_DECIMAL);
            }
            other => panic!("unexpected object {:?}", other),
        }
        assert_eq!(format_statement(&statement), line);
    }

    #[test]
    fn test_escaped_literal_survives_formatting() {
        let statement = Statement::in_default_graph(
            iri("http://example.org/s"),
            iri("http://example.org/comment"),
            Literal::new_simple_literal("line one\nsays \"hi\" \\ bye"),
        );
        let line = format_statement(&statement);
        assert!(!line.contains('\n'));
        assert_eq!(parse_statement(&line).unwrap(), statement);
    }

    #[test]
    fn test_language_tag_and_blank_node() {
        let statement = parse_statement("<http://example.org/s> <http://example.org/p> \"hallo\"@nl _:g1 .").unwrap();
        match &statement.object {
            Term::Literal(literal) => assert_eq!(literal.language(), Some("nl")),
            other => panic!("unexpected object {:?}", other),
        }
        assert!(matches!(statement.graph, GraphName::BlankNode(_)));
    }

    #[test]
    fn test_rejects_invalid_lines() {
        assert!(parse_statement("\"x\" <http://example.org/p> <http://example.org/o> .").is_err());
        assert!(parse_statement("_:b0 <http://example.org/p> <http://example.org/o> .").is_err());
        assert!(parse_statement("<http://example.org/s> <http://example.org/p> <http://example.org/o> . <http://example.org/s> <http://example.org/p> <http://example.org/o> .").is_err());
        assert!(parse_statement("").is_err());
    }

    #[test]
    fn test_header_escaping() {
        assert_eq!(escape("a\tb\nc\\"), "a\\tb\\nc\\\\");
        assert_eq!(unescape("a\\tb\\nc\\\\").unwrap(), "a\tb\nc\\");
        assert_eq!(unescape("caf\\u00E9").unwrap(), "café");
        assert!(unescape("bad \\q").is_err());
    }
}
