//! The tagged AST shared by the parser and every later stage.
//!
//! A [`Node`] is a tag plus ordered children, with optional annotation slots
//! that later pipeline stages fill in: the semantic analyzer attaches types
//! and symbols, the HIR generator attaches the operand holding each
//! expression's value. Leaf tokens appear as `NodeKind::Token` children so
//! the tree mirrors the concrete syntax (operator tokens, type specifier
//! keywords, literal lexemes).

use std::cell::RefCell;
use std::rc::Rc;

use colored::Colorize;

use crate::{
    diagnostics::{CompileError, Location, Result},
    frontend::lexer::{Token, TokenKind},
    middle::{hir::Operand, symtab::Symbol, ty::Type},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum NodeKind {
    Token,

    Unit,
    VariableDeclaration,
    StructType,
    UnionType,
    BasicType,
    DeclaratorList,
    NamedDeclarator,
    PointerDeclarator,
    ArrayDeclarator,
    FunctionDefinition,
    FunctionDeclaration,
    FunctionParameterList,
    FunctionParameter,
    StatementList,
    EmptyStatement,
    ExpressionStatement,
    ReturnStatement,
    ReturnExpressionStatement,
    WhileStatement,
    DoWhileStatement,
    ForStatement,
    IfStatement,
    IfElseStatement,
    StructTypeDefinition,
    UnionTypeDefinition,
    FieldDefinitionList,
    BinaryExpression,
    UnaryExpression,
    FunctionCallExpression,
    FieldRefExpression,
    IndirectFieldRefExpression,
    ArrayElementRefExpression,
    ArgumentExpressionList,
    VariableRef,
    LiteralValue,
    ImplicitConversion,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Integer {
        value: i64,
        is_unsigned: bool,
        is_long: bool,
    },
    Character(char),
    String(String),
}

impl LiteralValue {
    pub fn from_int_literal(lexeme: &str, loc: &Location) -> Result<Self> {
        let digits_end = lexeme
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(lexeme.len());
        let (digits, suffix) = lexeme.split_at(digits_end);

        let value: i64 = digits.parse().map_err(|_| {
            CompileError::syntax(loc.clone(), format!("invalid integer literal '{lexeme}'"))
        })?;

        Ok(Self::Integer {
            value,
            is_unsigned: suffix.contains(['u', 'U']),
            is_long: suffix.contains(['l', 'L']),
        })
    }

    pub fn from_char_literal(lexeme: &str) -> Self {
        Self::Character(lexeme.chars().next().unwrap_or('\0'))
    }

    pub fn from_str_literal(lexeme: &str) -> Self {
        Self::String(lexeme.to_owned())
    }

    /// Integer value of an integer or character literal.
    pub fn int_value(&self) -> i64 {
        match self {
            Self::Integer { value, .. } => *value,
            Self::Character(c) => *c as i64,
            Self::String(_) => panic!("string literal has no integer value"),
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Self::Integer { is_long: true, .. })
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, Self::Integer { is_unsigned: true, .. })
    }
}

#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub loc: Location,
    pub lexeme: Option<String>,
    pub kids: Vec<Node>,

    // annotations filled by later stages
    pub ty: Option<Rc<Type>>,
    pub symbol: Option<Rc<RefCell<Symbol>>>,
    pub literal: Option<LiteralValue>,
    pub operand: Option<Operand>,

    token_kind: Option<TokenKind>,
}

impl Node {
    pub fn new(kind: NodeKind, loc: Location, kids: Vec<Node>) -> Self {
        Self {
            kind,
            loc,
            lexeme: None,
            kids,
            ty: None,
            symbol: None,
            literal: None,
            operand: None,
            token_kind: None,
        }
    }

    pub fn token(token: Token) -> Self {
        Self {
            kind: NodeKind::Token,
            loc: token.loc,
            lexeme: Some(token.lexeme),
            kids: Vec::new(),
            ty: None,
            symbol: None,
            literal: None,
            operand: None,
            token_kind: Some(token.kind),
        }
    }

    pub fn with_lexeme(mut self, lexeme: impl Into<String>) -> Self {
        self.lexeme = Some(lexeme.into());
        self
    }

    pub fn token_kind(&self) -> TokenKind {
        self.token_kind.expect("node is not a token")
    }

    pub fn kid(&self, index: usize) -> &Node {
        &self.kids[index]
    }

    pub fn kid_mut(&mut self, index: usize) -> &mut Node {
        &mut self.kids[index]
    }

    /// Lexeme of this node, or of its single identifier token child. The
    /// semantic analyzer hoists declarator names so this is always present
    /// where a name is expected.
    pub fn str(&self) -> &str {
        self.lexeme
            .as_deref()
            .expect("node carries no string lexeme")
    }

    pub fn set_type(&mut self, ty: Rc<Type>) {
        self.ty = Some(ty);
    }

    pub fn ty(&self) -> Rc<Type> {
        self.ty.clone().expect("node has no type annotation")
    }

    pub fn has_symbol(&self) -> bool {
        self.symbol.is_some()
    }

    pub fn set_symbol(&mut self, symbol: Rc<RefCell<Symbol>>) {
        self.symbol = Some(symbol);
    }

    pub fn symbol(&self) -> Rc<RefCell<Symbol>> {
        self.symbol.clone().expect("node has no symbol annotation")
    }

    /// Index of a declarator's initializer expression, if one was parsed
    /// (always the last child, after the declarator's structural children).
    pub fn declarator_initializer_index(&self) -> Option<usize> {
        let structural = match self.kind {
            NodeKind::NamedDeclarator | NodeKind::PointerDeclarator => 1,
            NodeKind::ArrayDeclarator => 2,
            _ => return None,
        };
        (self.kids.len() > structural).then_some(self.kids.len() - 1)
    }

    pub fn set_operand(&mut self, operand: Operand) {
        self.operand = Some(operand);
    }

    pub fn operand(&self) -> Operand {
        self.operand.clone().expect("node has no operand")
    }

    /// Print the tree, one node per line, children indented. Used by `-p`.
    pub fn print_tree(&self) {
        self.print_tree_at(0);
    }

    fn print_tree_at(&self, depth: usize) {
        let mut line = format!("{:indent$}{}", "", self.kind, indent = depth * 2);
        if let Some(kind) = self.token_kind {
            line = format!("{:indent$}{:?}", "", kind, indent = depth * 2);
        }
        if let Some(lexeme) = &self.lexeme {
            println!("{} {}", line.cyan(), format!("[{lexeme}]").yellow());
        } else {
            println!("{}", line.cyan());
        }
        for kid in &self.kids {
            kid.print_tree_at(depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn loc() -> Location {
        Location::new(Rc::new(PathBuf::from("t.c")), 1, 1)
    }

    #[test]
    fn int_literal_suffixes_parse() {
        let lit = LiteralValue::from_int_literal("42UL", &loc()).unwrap();
        assert_eq!(lit.int_value(), 42);
        assert!(lit.is_unsigned());
        assert!(lit.is_long());

        let lit = LiteralValue::from_int_literal("7", &loc()).unwrap();
        assert!(!lit.is_unsigned());
        assert!(!lit.is_long());
    }

    #[test]
    fn char_literal_int_value_is_codepoint() {
        let lit = LiteralValue::from_char_literal("A");
        assert_eq!(lit.int_value(), 65);
    }
}
