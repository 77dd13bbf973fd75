//! Recursive-descent parser for the specification grammar (spec §6).
//!
//! ```text
//! spec        := "(" givens ")" "{" matches "}" [ "=>" projection ]
//! givens      := labeled-given { "," labeled-given }
//! labeled-given := IDENT ":" TYPE [ "[" conditions "]" ]
//! matches     := { match }
//! match       := IDENT ":" TYPE "[" conditions "]"
//! conditions  := { condition }
//! condition   := path | existential
//! path        := IDENT [ "->" role-chain ] "=" IDENT [ "->" role-chain ]
//! existential := ("E" | "!E") "{" matches "}"
//! projection  := IDENT | IDENT "." FIELD | "@" IDENT | spec | composite
//! composite   := "{" { name "=" projection } "}"
//! ```
//!
//! `E` is a soft keyword: it is only treated as the existential marker when
//! immediately followed by `{`, so a label actually named `E` used anywhere
//! else still parses as an ordinary identifier.

use crate::error::BuildError;
use crate::spec::ast::{
    Condition, ExistentialCondition, LabeledGiven, Match, PathCondition, Projection,
    Specification,
};
use crate::spec::token::{Lexer, Token, TokenKind};

pub fn parse(src: &str) -> Result<Specification, BuildError> {
    let tokens = Lexer::new(src).tokenize().map_err(BuildError::SyntaxError)?;
    let mut parser = Parser { tokens, pos: 0 };
    let spec = parser.parse_specification()?;
    parser.expect_eof()?;
    Ok(spec)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.tokens[self.pos].kind.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn expect(&mut self, expected: &TokenKind) -> Result<(), BuildError> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(BuildError::SyntaxError(format!(
                "expected {:?}, found {:?}",
                expected,
                self.peek()
            )))
        }
    }

    fn expect_eof(&self) -> Result<(), BuildError> {
        if *self.peek() == TokenKind::Eof {
            Ok(())
        } else {
            Err(BuildError::SyntaxError(format!(
                "trailing input at {:?}",
                self.peek()
            )))
        }
    }

    fn expect_ident(&mut self) -> Result<String, BuildError> {
        match self.advance() {
            TokenKind::Ident(s) => Ok(s),
            other => Err(BuildError::SyntaxError(format!(
                "expected identifier, found {:?}",
                other
            ))),
        }
    }

    /// A dotted type name: `Office` or `Office.Closed`.
    fn expect_type_name(&mut self) -> Result<String, BuildError> {
        let mut name = self.expect_ident()?;
        while *self.peek() == TokenKind::Dot {
            self.advance();
            name.push('.');
            name.push_str(&self.expect_ident()?);
        }
        Ok(name)
    }

    /// A dot-separated role chain following `->`.
    fn parse_role_chain(&mut self) -> Result<Vec<String>, BuildError> {
        let mut roles = vec![self.expect_ident()?];
        while *self.peek() == TokenKind::Dot {
            self.advance();
            roles.push(self.expect_ident()?);
        }
        Ok(roles)
    }

    fn parse_specification(&mut self) -> Result<Specification, BuildError> {
        self.expect(&TokenKind::LParen)?;
        let given = self.parse_givens()?;
        self.expect(&TokenKind::RParen)?;
        self.expect(&TokenKind::LBrace)?;
        let matches = self.parse_matches()?;
        self.expect(&TokenKind::RBrace)?;

        let projection = if *self.peek() == TokenKind::FatArrow {
            self.advance();
            self.parse_projection()?
        } else {
            // A specification with no explicit projection projects nothing
            // but the empty composite — useful for existence-only queries.
            Projection::Composite(Vec::new())
        };

        Ok(Specification::new(given, matches, projection))
    }

    fn parse_givens(&mut self) -> Result<Vec<LabeledGiven>, BuildError> {
        let mut givens = Vec::new();
        if *self.peek() == TokenKind::RParen {
            return Ok(givens);
        }
        loop {
            givens.push(self.parse_labeled_given()?);
            if *self.peek() == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        Ok(givens)
    }

    fn parse_labeled_given(&mut self) -> Result<LabeledGiven, BuildError> {
        let label = self.expect_ident()?;
        self.expect(&TokenKind::Colon)?;
        let fact_type = self.expect_type_name()?;
        let conditions = self.parse_optional_bracketed_conditions()?;
        Ok(LabeledGiven {
            label,
            fact_type,
            conditions,
        })
    }

    fn parse_matches(&mut self) -> Result<Vec<Match>, BuildError> {
        let mut matches = Vec::new();
        while matches!(self.peek(), TokenKind::Ident(_)) {
            matches.push(self.parse_match()?);
        }
        Ok(matches)
    }

    fn parse_match(&mut self) -> Result<Match, BuildError> {
        let unknown = self.expect_ident()?;
        self.expect(&TokenKind::Colon)?;
        let fact_type = self.expect_type_name()?;
        let conditions = self.parse_optional_bracketed_conditions()?;
        Ok(Match {
            unknown,
            fact_type,
            conditions,
        })
    }

    fn parse_optional_bracketed_conditions(&mut self) -> Result<Vec<Condition>, BuildError> {
        if *self.peek() == TokenKind::LBracket {
            self.advance();
            let conditions = self.parse_conditions()?;
            self.expect(&TokenKind::RBracket)?;
            Ok(conditions)
        } else {
            Ok(Vec::new())
        }
    }

    fn parse_conditions(&mut self) -> Result<Vec<Condition>, BuildError> {
        let mut conditions = Vec::new();
        loop {
            match self.peek() {
                TokenKind::RBracket => break,
                TokenKind::Bang => conditions.push(self.parse_existential(false)?),
                TokenKind::Ident(name) if name == "E" && *self.peek_at(1) == TokenKind::LBrace => {
                    conditions.push(self.parse_existential(true)?);
                }
                TokenKind::Ident(_) => conditions.push(self.parse_path()?),
                other => {
                    return Err(BuildError::SyntaxError(format!(
                        "unexpected token in conditions: {:?}",
                        other
                    )));
                }
            }
        }
        Ok(conditions)
    }

    fn parse_existential(&mut self, positive: bool) -> Result<Condition, BuildError> {
        if !positive {
            self.expect(&TokenKind::Bang)?;
        }
        let e = self.expect_ident()?;
        if e != "E" {
            return Err(BuildError::SyntaxError(format!(
                "expected existential marker `E`, found `{e}`"
            )));
        }
        self.expect(&TokenKind::LBrace)?;
        let matches = self.parse_matches()?;
        self.expect(&TokenKind::RBrace)?;
        Ok(Condition::Existential(ExistentialCondition {
            exists: positive,
            matches,
        }))
    }

    fn parse_path(&mut self) -> Result<Condition, BuildError> {
        let left_label = self.expect_ident()?;
        let left_roles = self.parse_optional_role_chain()?;
        self.expect(&TokenKind::Equals)?;
        let right_label = self.expect_ident()?;
        let right_roles = self.parse_optional_role_chain()?;
        Ok(Condition::Path(PathCondition {
            left_label,
            left_roles,
            right_label,
            right_roles,
        }))
    }

    fn parse_optional_role_chain(&mut self) -> Result<Vec<String>, BuildError> {
        if *self.peek() == TokenKind::Arrow {
            self.advance();
            self.parse_role_chain()
        } else {
            Ok(Vec::new())
        }
    }

    fn parse_projection(&mut self) -> Result<Projection, BuildError> {
        match self.peek().clone() {
            TokenKind::At => {
                self.advance();
                let label = self.expect_ident()?;
                Ok(Projection::FactTime(label))
            }
            TokenKind::LParen => {
                let spec = self.parse_specification()?;
                Ok(Projection::Specification(Box::new(spec)))
            }
            TokenKind::LBrace => self.parse_composite(),
            TokenKind::Ident(_) => {
                let label = self.expect_ident()?;
                if *self.peek() == TokenKind::Dot {
                    self.advance();
                    let field = self.expect_ident()?;
                    Ok(Projection::Field { label, field })
                } else {
                    Ok(Projection::Label(label))
                }
            }
            other => Err(BuildError::SyntaxError(format!(
                "expected projection, found {:?}",
                other
            ))),
        }
    }

    fn parse_composite(&mut self) -> Result<Projection, BuildError> {
        self.expect(&TokenKind::LBrace)?;
        let mut entries = Vec::new();
        while *self.peek() != TokenKind::RBrace {
            let name = self.expect_ident()?;
            self.expect(&TokenKind::Equals)?;
            let projection = self.parse_projection()?;
            entries.push((name, projection));
            if *self.peek() == TokenKind::Comma {
                self.advance();
            }
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(Projection::Composite(entries))
    }
}
