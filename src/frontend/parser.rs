//! Recursive-descent parser producing the tagged AST.
//!
//! Declarators follow the grammar's intended nesting: array suffixes bind
//! tighter than pointer stars, so `int *p[3]` parses as pointer-above-array
//! and `int (*p)[3]` (with a parenthesized declarator) as array-above-pointer.
//! The semantic analyzer derives types by walking the declarator tree from
//! the outside in, which reads both forms correctly.

use crate::{
    diagnostics::{CompileError, Location, Result},
    frontend::{
        SourceFile,
        ast::{Node, NodeKind},
        lexer::{Keyword, Lexer, Token, TokenKind},
    },
};

#[derive(Debug)]
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    eof_loc: Location,
}

impl Parser {
    pub fn parse_unit(source: &SourceFile) -> Result<Node> {
        let tokens = Lexer::scan_all(source)?;

        let eof_loc = tokens
            .last()
            .map(|t| t.loc.clone())
            .unwrap_or_else(|| crate::diagnostics::file_start(&source.origin.as_path()));

        let mut parser = Self {
            tokens,
            pos: 0,
            eof_loc,
        };

        let start = parser.location();
        let mut items = Vec::new();
        while parser.peek().is_some() {
            items.push(parser.parse_top_level_item()?);
        }

        Ok(Node::new(NodeKind::Unit, start, items))
    }

    /* Token navigation */

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n)
    }

    fn location(&self) -> Location {
        self.peek()
            .map(|t| t.loc.clone())
            .unwrap_or_else(|| self.eof_loc.clone())
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().is_some_and(|t| t.kind == kind)
    }

    fn eat(&mut self, kind: TokenKind) -> Option<Token> {
        if self.check(kind) { self.bump() } else { None }
    }

    fn expect(&mut self, kind: TokenKind, expecting: &str) -> Result<Token> {
        match self.peek() {
            Some(token) if token.kind == kind => Ok(self.bump().unwrap()),
            Some(token) => Err(CompileError::syntax(
                token.loc.clone(),
                format!("expected {expecting} but found '{}'", token.lexeme),
            )),
            None => Err(CompileError::syntax(
                self.eof_loc.clone(),
                format!("expected {expecting} but reached end of file"),
            )),
        }
    }

    /* Top level */

    fn parse_top_level_item(&mut self) -> Result<Node> {
        // `struct S { ... };` is a type definition; `struct S x;` declares a
        // variable. Disambiguate on the brace after the tag.
        if self.check(TokenKind::Keyword(Keyword::Struct))
            && self
                .peek_nth(2)
                .is_some_and(|t| t.kind == TokenKind::OpenBrace)
        {
            return self.parse_struct_type_definition();
        }
        if self.check(TokenKind::Keyword(Keyword::Union))
            && self
                .peek_nth(2)
                .is_some_and(|t| t.kind == TokenKind::OpenBrace)
        {
            return self.parse_union_type_definition();
        }

        let loc = self.location();
        let base_type = self.parse_base_type()?;
        let declarator = self.parse_declarator()?;

        if self.check(TokenKind::OpenParen) {
            return self.parse_function(loc, base_type, declarator);
        }

        self.parse_rest_of_variable_declaration(loc, base_type, declarator)
    }

    fn parse_struct_type_definition(&mut self) -> Result<Node> {
        let loc = self.location();
        self.expect(TokenKind::Keyword(Keyword::Struct), "'struct'")?;
        let tag = self.expect(TokenKind::Identifier, "struct tag")?;
        self.expect(TokenKind::OpenBrace, "'{'")?;

        let fields_loc = self.location();
        let mut fields = Vec::new();
        while !self.check(TokenKind::CloseBrace) {
            fields.push(self.parse_variable_declaration()?);
        }
        self.expect(TokenKind::CloseBrace, "'}'")?;
        self.expect(TokenKind::Semicolon, "';' after struct definition")?;

        let tag_name = tag.lexeme.clone();
        let kids = vec![
            Node::token(tag),
            Node::new(NodeKind::FieldDefinitionList, fields_loc, fields),
        ];
        Ok(Node::new(NodeKind::StructTypeDefinition, loc, kids).with_lexeme(tag_name))
    }

    fn parse_union_type_definition(&mut self) -> Result<Node> {
        // parsed so the analyzer can reject it with a proper diagnostic
        let loc = self.location();
        self.expect(TokenKind::Keyword(Keyword::Union), "'union'")?;
        let tag = self.expect(TokenKind::Identifier, "union tag")?;
        self.expect(TokenKind::OpenBrace, "'{'")?;

        let fields_loc = self.location();
        let mut fields = Vec::new();
        while !self.check(TokenKind::CloseBrace) {
            fields.push(self.parse_variable_declaration()?);
        }
        self.expect(TokenKind::CloseBrace, "'}'")?;
        self.expect(TokenKind::Semicolon, "';' after union definition")?;

        let tag_name = tag.lexeme.clone();
        let kids = vec![
            Node::token(tag),
            Node::new(NodeKind::FieldDefinitionList, fields_loc, fields),
        ];
        Ok(Node::new(NodeKind::UnionTypeDefinition, loc, kids).with_lexeme(tag_name))
    }

    /* Types and declarators */

    fn at_base_type(&self) -> bool {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Keyword(kw),
                ..
            }) => kw.is_type_specifier() || matches!(kw, Keyword::Struct | Keyword::Union),
            _ => false,
        }
    }

    fn parse_base_type(&mut self) -> Result<Node> {
        let loc = self.location();

        if self.check(TokenKind::Keyword(Keyword::Struct)) {
            self.bump();
            let tag = self.expect(TokenKind::Identifier, "struct tag")?;
            let tag_name = tag.lexeme.clone();
            return Ok(
                Node::new(NodeKind::StructType, loc, vec![Node::token(tag)])
                    .with_lexeme(tag_name),
            );
        }
        if self.check(TokenKind::Keyword(Keyword::Union)) {
            self.bump();
            let tag = self.expect(TokenKind::Identifier, "union tag")?;
            let tag_name = tag.lexeme.clone();
            return Ok(
                Node::new(NodeKind::UnionType, loc, vec![Node::token(tag)]).with_lexeme(tag_name),
            );
        }

        let mut specifiers = Vec::new();
        while let Some(token) = self.peek() {
            match token.kind {
                TokenKind::Keyword(kw) if kw.is_type_specifier() => {
                    specifiers.push(Node::token(self.bump().unwrap()));
                }
                _ => break,
            }
        }

        if specifiers.is_empty() {
            return Err(CompileError::syntax(loc, "expected a type"));
        }

        Ok(Node::new(NodeKind::BasicType, loc, specifiers))
    }

    fn parse_declarator(&mut self) -> Result<Node> {
        if let Some(star) = self.eat(TokenKind::Asterisk) {
            let inner = self.parse_declarator()?;
            return Ok(Node::new(NodeKind::PointerDeclarator, star.loc, vec![inner]));
        }
        self.parse_direct_declarator()
    }

    fn parse_direct_declarator(&mut self) -> Result<Node> {
        let mut declarator = if self.check(TokenKind::OpenParen) {
            self.bump();
            let inner = self.parse_declarator()?;
            self.expect(TokenKind::CloseParen, "')'")?;
            inner
        } else {
            let name = self.expect(TokenKind::Identifier, "declarator name")?;
            let name_str = name.lexeme.clone();
            let loc = name.loc.clone();
            Node::new(NodeKind::NamedDeclarator, loc, vec![Node::token(name)])
                .with_lexeme(name_str)
        };

        while let Some(bracket) = self.eat(TokenKind::OpenBracket) {
            let size = self.expect(TokenKind::IntLiteral, "array size")?;
            self.expect(TokenKind::CloseBracket, "']'")?;
            declarator = Node::new(
                NodeKind::ArrayDeclarator,
                bracket.loc,
                vec![declarator, Node::token(size)],
            );
        }

        Ok(declarator)
    }

    fn parse_variable_declaration(&mut self) -> Result<Node> {
        let loc = self.location();
        let base_type = self.parse_base_type()?;
        let declarator = self.parse_declarator()?;
        self.parse_rest_of_variable_declaration(loc, base_type, declarator)
    }

    fn parse_rest_of_variable_declaration(
        &mut self,
        loc: Location,
        base_type: Node,
        first_declarator: Node,
    ) -> Result<Node> {
        let list_loc = first_declarator.loc.clone();
        let mut declarators = vec![self.parse_optional_initializer(first_declarator)?];
        while self.eat(TokenKind::Comma).is_some() {
            let declarator = self.parse_declarator()?;
            declarators.push(self.parse_optional_initializer(declarator)?);
        }
        self.expect(TokenKind::Semicolon, "';' after declaration")?;

        let kids = vec![
            base_type,
            Node::new(NodeKind::DeclaratorList, list_loc, declarators),
        ];
        Ok(Node::new(NodeKind::VariableDeclaration, loc, kids))
    }

    /// An optional `= expression` initializer, appended as the declarator's
    /// last child.
    fn parse_optional_initializer(&mut self, mut declarator: Node) -> Result<Node> {
        if self.eat(TokenKind::Equals).is_some() {
            let initializer = self.parse_expression()?;
            declarator.kids.push(initializer);
        }
        Ok(declarator)
    }

    /* Functions */

    fn parse_function(
        &mut self,
        loc: Location,
        base_type: Node,
        declarator: Node,
    ) -> Result<Node> {
        // the declarator leaf names the function; pointer wrapping applies to
        // the return type
        let name = declarator_leaf_name(&declarator).ok_or_else(|| {
            CompileError::syntax(declarator.loc.clone(), "expected a function name")
        })?;
        let name_token = Token {
            kind: TokenKind::Identifier,
            lexeme: name.clone(),
            loc: declarator.loc.clone(),
        };

        self.expect(TokenKind::OpenParen, "'('")?;
        let params_loc = self.location();
        let mut params = Vec::new();

        if self.check(TokenKind::Keyword(Keyword::Void))
            && self
                .peek_nth(1)
                .is_some_and(|t| t.kind == TokenKind::CloseParen)
        {
            self.bump();
        } else if !self.check(TokenKind::CloseParen) {
            loop {
                params.push(self.parse_parameter()?);
                if self.eat(TokenKind::Comma).is_none() {
                    break;
                }
            }
        }
        self.expect(TokenKind::CloseParen, "')'")?;

        let param_list = Node::new(NodeKind::FunctionParameterList, params_loc, params);

        if self.eat(TokenKind::Semicolon).is_some() {
            let kids = vec![base_type, declarator, Node::token(name_token), param_list];
            return Ok(Node::new(NodeKind::FunctionDeclaration, loc, kids).with_lexeme(name));
        }

        let body = self.parse_statement_list()?;
        let kids = vec![
            base_type,
            declarator,
            Node::token(name_token),
            param_list,
            body,
        ];
        Ok(Node::new(NodeKind::FunctionDefinition, loc, kids).with_lexeme(name))
    }

    fn parse_parameter(&mut self) -> Result<Node> {
        let loc = self.location();
        let base_type = self.parse_base_type()?;
        let declarator = self.parse_declarator()?;
        Ok(Node::new(
            NodeKind::FunctionParameter,
            loc,
            vec![base_type, declarator],
        ))
    }

    /* Statements */

    fn parse_statement_list(&mut self) -> Result<Node> {
        let loc = self.location();
        self.expect(TokenKind::OpenBrace, "'{'")?;

        let mut items = Vec::new();
        while !self.check(TokenKind::CloseBrace) {
            if self.peek().is_none() {
                return Err(CompileError::syntax(self.eof_loc.clone(), "expected '}'"));
            }
            if self.at_base_type() {
                items.push(self.parse_variable_declaration()?);
            } else {
                items.push(self.parse_statement()?);
            }
        }
        self.expect(TokenKind::CloseBrace, "'}'")?;

        Ok(Node::new(NodeKind::StatementList, loc, items))
    }

    fn parse_statement(&mut self) -> Result<Node> {
        let loc = self.location();

        if self.eat(TokenKind::Semicolon).is_some() {
            return Ok(Node::new(NodeKind::EmptyStatement, loc, vec![]));
        }
        if self.check(TokenKind::OpenBrace) {
            return self.parse_statement_list();
        }

        if let Some(Token {
            kind: TokenKind::Keyword(kw),
            ..
        }) = self.peek()
        {
            match kw {
                Keyword::Return => {
                    self.bump();
                    if self.eat(TokenKind::Semicolon).is_some() {
                        return Ok(Node::new(NodeKind::ReturnStatement, loc, vec![]));
                    }
                    let value = self.parse_expression()?;
                    self.expect(TokenKind::Semicolon, "';' after return")?;
                    return Ok(Node::new(
                        NodeKind::ReturnExpressionStatement,
                        loc,
                        vec![value],
                    ));
                }
                Keyword::While => {
                    self.bump();
                    self.expect(TokenKind::OpenParen, "'('")?;
                    let condition = self.parse_expression()?;
                    self.expect(TokenKind::CloseParen, "')'")?;
                    let body = self.parse_statement()?;
                    return Ok(Node::new(
                        NodeKind::WhileStatement,
                        loc,
                        vec![condition, body],
                    ));
                }
                Keyword::Do => {
                    self.bump();
                    let body = self.parse_statement()?;
                    self.expect(TokenKind::Keyword(Keyword::While), "'while'")?;
                    self.expect(TokenKind::OpenParen, "'('")?;
                    let condition = self.parse_expression()?;
                    self.expect(TokenKind::CloseParen, "')'")?;
                    self.expect(TokenKind::Semicolon, "';'")?;
                    return Ok(Node::new(
                        NodeKind::DoWhileStatement,
                        loc,
                        vec![body, condition],
                    ));
                }
                Keyword::For => {
                    self.bump();
                    self.expect(TokenKind::OpenParen, "'('")?;
                    let init = self.parse_optional_expression_statement(TokenKind::Semicolon)?;
                    let condition =
                        self.parse_optional_expression_statement(TokenKind::Semicolon)?;
                    let update = self.parse_optional_expression_statement(TokenKind::CloseParen)?;
                    let body = self.parse_statement()?;
                    return Ok(Node::new(
                        NodeKind::ForStatement,
                        loc,
                        vec![init, condition, update, body],
                    ));
                }
                Keyword::If => {
                    self.bump();
                    self.expect(TokenKind::OpenParen, "'('")?;
                    let condition = self.parse_expression()?;
                    self.expect(TokenKind::CloseParen, "')'")?;
                    let then_branch = self.parse_statement()?;
                    if self.eat(TokenKind::Keyword(Keyword::Else)).is_some() {
                        let else_branch = self.parse_statement()?;
                        return Ok(Node::new(
                            NodeKind::IfElseStatement,
                            loc,
                            vec![condition, then_branch, else_branch],
                        ));
                    }
                    return Ok(Node::new(
                        NodeKind::IfStatement,
                        loc,
                        vec![condition, then_branch],
                    ));
                }
                _ => {}
            }
        }

        let expr = self.parse_expression()?;
        self.expect(TokenKind::Semicolon, "';' after expression")?;
        Ok(Node::new(NodeKind::ExpressionStatement, loc, vec![expr]))
    }

    /// A `for` header slot: either an expression or nothing before `stop`.
    fn parse_optional_expression_statement(&mut self, stop: TokenKind) -> Result<Node> {
        let loc = self.location();
        if self.eat(stop).is_some() {
            return Ok(Node::new(NodeKind::EmptyStatement, loc, vec![]));
        }
        let expr = self.parse_expression()?;
        self.expect(stop, "end of for-clause")?;
        Ok(Node::new(NodeKind::ExpressionStatement, loc, vec![expr]))
    }

    /* Expressions */

    pub fn parse_expression(&mut self) -> Result<Node> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Node> {
        let lhs = self.parse_logical_or()?;

        if self.check(TokenKind::Equals) {
            let op = self.bump().unwrap();
            let loc = op.loc.clone();
            // right-associative
            let rhs = self.parse_assignment()?;
            return Ok(Node::new(
                NodeKind::BinaryExpression,
                loc,
                vec![Node::token(op), lhs, rhs],
            ));
        }

        Ok(lhs)
    }

    fn parse_binary_level(
        &mut self,
        matches_op: fn(TokenKind) -> bool,
        next: fn(&mut Self) -> Result<Node>,
    ) -> Result<Node> {
        let mut lhs = next(self)?;
        while self.peek().is_some_and(|t| matches_op(t.kind)) {
            let op = self.bump().unwrap();
            let loc = op.loc.clone();
            let rhs = next(self)?;
            lhs = Node::new(
                NodeKind::BinaryExpression,
                loc,
                vec![Node::token(op), lhs, rhs],
            );
        }
        Ok(lhs)
    }

    fn parse_logical_or(&mut self) -> Result<Node> {
        self.parse_binary_level(|k| k == TokenKind::LogicalOr, Self::parse_logical_and)
    }

    fn parse_logical_and(&mut self) -> Result<Node> {
        self.parse_binary_level(|k| k == TokenKind::LogicalAnd, Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Node> {
        self.parse_binary_level(
            |k| matches!(k, TokenKind::DoubleEquals | TokenKind::NotEquals),
            Self::parse_relational,
        )
    }

    fn parse_relational(&mut self) -> Result<Node> {
        self.parse_binary_level(
            |k| {
                matches!(
                    k,
                    TokenKind::LessThan
                        | TokenKind::LessThanOrEqualTo
                        | TokenKind::GreaterThan
                        | TokenKind::GreaterThanOrEqualTo
                )
            },
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Node> {
        self.parse_binary_level(|k| k.is_term_operator(), Self::parse_multiplicative)
    }

    fn parse_multiplicative(&mut self) -> Result<Node> {
        self.parse_binary_level(|k| k.is_factor_operator(), Self::parse_unary)
    }

    fn parse_unary(&mut self) -> Result<Node> {
        if self.peek().is_some_and(|t| t.kind.is_unary_operator()) {
            let op = self.bump().unwrap();
            let loc = op.loc.clone();
            let operand = self.parse_unary()?;
            return Ok(Node::new(
                NodeKind::UnaryExpression,
                loc,
                vec![Node::token(op), operand],
            ));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Node> {
        let mut expr = self.parse_primary()?;

        loop {
            if let Some(paren) = self.eat(TokenKind::OpenParen) {
                let mut args = Vec::new();
                if !self.check(TokenKind::CloseParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if self.eat(TokenKind::Comma).is_none() {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::CloseParen, "')'")?;
                let arg_list = Node::new(NodeKind::ArgumentExpressionList, paren.loc.clone(), args);
                expr = Node::new(
                    NodeKind::FunctionCallExpression,
                    paren.loc,
                    vec![expr, arg_list],
                );
            } else if let Some(bracket) = self.eat(TokenKind::OpenBracket) {
                let index = self.parse_expression()?;
                self.expect(TokenKind::CloseBracket, "']'")?;
                expr = Node::new(
                    NodeKind::ArrayElementRefExpression,
                    bracket.loc,
                    vec![expr, index],
                );
            } else if let Some(dot) = self.eat(TokenKind::Dot) {
                let field = self.expect(TokenKind::Identifier, "field name")?;
                expr = Node::new(
                    NodeKind::FieldRefExpression,
                    dot.loc,
                    vec![expr, Node::token(field)],
                );
            } else if let Some(arrow) = self.eat(TokenKind::Arrow) {
                let field = self.expect(TokenKind::Identifier, "field name")?;
                expr = Node::new(
                    NodeKind::IndirectFieldRefExpression,
                    arrow.loc,
                    vec![expr, Node::token(field)],
                );
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Node> {
        let Some(token) = self.peek().cloned() else {
            return Err(CompileError::syntax(
                self.eof_loc.clone(),
                "expected an expression but reached end of file",
            ));
        };

        match token.kind {
            TokenKind::Identifier => {
                self.bump();
                let name = token.lexeme.clone();
                Ok(Node::new(NodeKind::VariableRef, token.loc, vec![]).with_lexeme(name))
            }
            TokenKind::IntLiteral | TokenKind::CharLiteral | TokenKind::StrLiteral => {
                self.bump();
                let loc = token.loc.clone();
                let lexeme = token.lexeme.clone();
                Ok(
                    Node::new(NodeKind::LiteralValue, loc, vec![Node::token(token)])
                        .with_lexeme(lexeme),
                )
            }
            TokenKind::OpenParen => {
                self.bump();
                let expr = self.parse_expression()?;
                self.expect(TokenKind::CloseParen, "')'")?;
                Ok(expr)
            }
            _ => Err(CompileError::syntax(
                token.loc,
                format!("expected an expression but found '{}'", token.lexeme),
            )),
        }
    }
}

/// Name at the leaf of a declarator chain, if the leaf has been parsed.
fn declarator_leaf_name(declarator: &Node) -> Option<String> {
    match declarator.kind {
        NodeKind::NamedDeclarator => declarator.lexeme.clone(),
        NodeKind::PointerDeclarator | NodeKind::ArrayDeclarator => {
            declarator_leaf_name(declarator.kid(0))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::SourceFileOrigin;

    fn parse(source: &str) -> Node {
        let source = SourceFile {
            contents: source.to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        Parser::parse_unit(&source).unwrap()
    }

    #[test]
    fn parses_minimal_function() {
        let unit = parse("int main(void) { return 0; }");
        assert_eq!(unit.kind, NodeKind::Unit);
        let func = unit.kid(0);
        assert_eq!(func.kind, NodeKind::FunctionDefinition);
        assert_eq!(func.str(), "main");
        let body = func.kid(4);
        assert_eq!(body.kind, NodeKind::StatementList);
        assert_eq!(body.kid(0).kind, NodeKind::ReturnExpressionStatement);
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let unit = parse("int main(void) { int a; a = 2 + 3 * 4; return a; }");
        let body = unit.kid(0).kid(4);
        let assign = body.kid(1).kid(0);
        assert_eq!(assign.kind, NodeKind::BinaryExpression);
        // rhs of the assignment is the `+` with `*` nested on its right
        let sum = assign.kid(2);
        assert_eq!(sum.kid(0).token_kind(), TokenKind::Plus);
        let product = sum.kid(2);
        assert_eq!(product.kid(0).token_kind(), TokenKind::Asterisk);
    }

    #[test]
    fn array_suffix_binds_tighter_than_pointer() {
        // int *p[3]; => pointer declarator above array declarator
        let unit = parse("int main(void) { int *p[3]; }");
        let decl = unit.kid(0).kid(4).kid(0);
        let declarator = decl.kid(1).kid(0);
        assert_eq!(declarator.kind, NodeKind::PointerDeclarator);
        assert_eq!(declarator.kid(0).kind, NodeKind::ArrayDeclarator);
    }

    #[test]
    fn parenthesized_declarator_flips_nesting() {
        // int (*p)[3]; => array declarator above pointer declarator
        let unit = parse("int main(void) { int (*p)[3]; }");
        let decl = unit.kid(0).kid(4).kid(0);
        let declarator = decl.kid(1).kid(0);
        assert_eq!(declarator.kind, NodeKind::ArrayDeclarator);
        assert_eq!(declarator.kid(0).kind, NodeKind::PointerDeclarator);
    }

    #[test]
    fn postfix_chains_nest_left_to_right() {
        let unit = parse("int main(void) { q->next.v[1]; }");
        let expr = unit.kid(0).kid(4).kid(0).kid(0);
        assert_eq!(expr.kind, NodeKind::ArrayElementRefExpression);
        assert_eq!(expr.kid(0).kind, NodeKind::FieldRefExpression);
        assert_eq!(expr.kid(0).kid(0).kind, NodeKind::IndirectFieldRefExpression);
    }

    #[test]
    fn struct_definition_and_reference() {
        let unit = parse("struct P { int x; int y; }; int main(void) { struct P p; }");
        assert_eq!(unit.kid(0).kind, NodeKind::StructTypeDefinition);
        assert_eq!(unit.kid(0).str(), "P");
        let decl = unit.kid(1).kid(4).kid(0);
        assert_eq!(decl.kid(0).kind, NodeKind::StructType);
        assert_eq!(decl.kid(0).str(), "P");
    }

    #[test]
    fn missing_semicolon_is_a_syntax_error() {
        let source = SourceFile {
            contents: "int main(void) { return 0 }".to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        assert!(Parser::parse_unit(&source).is_err());
    }
}
