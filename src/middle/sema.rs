//! Semantic analysis: a post-order walk that annotates every AST node with a
//! type (and a symbol where applicable), enforces the typing rules, and
//! canonicalises declarators so the variable name is always present at the
//! leaf.
//!
//! Implicit integer promotion is represented in the tree: the analyzer wraps
//! an operand in an `implicit_conversion` node carrying the promoted type,
//! and the HIR generator later emits the matching widening opcode.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use crate::{
    diagnostics::{CompileError, Result},
    frontend::{
        ast::{LiteralValue, Node, NodeKind},
        lexer::{Keyword, TokenKind},
    },
    middle::{
        symtab::{Symbol, SymbolKind, SymbolRef, SymbolTable},
        ty::{BasicTypeKind, Member, Type, TypeQualifier},
    },
};

pub struct SemanticAnalysis {
    global: Rc<RefCell<SymbolTable>>,
    current: Rc<RefCell<SymbolTable>>,
}

impl SemanticAnalysis {
    pub fn new() -> Self {
        let global = Rc::new(RefCell::new(SymbolTable::new(None, "root")));
        Self {
            current: global.clone(),
            global,
        }
    }

    pub fn global_symtab(&self) -> Rc<RefCell<SymbolTable>> {
        self.global.clone()
    }

    pub fn visit(&mut self, n: &mut Node) -> Result<()> {
        match n.kind {
            NodeKind::Unit => self.visit_children(n),
            NodeKind::VariableDeclaration => self.visit_variable_declaration(n),
            NodeKind::BasicType => self.visit_basic_type(n),
            NodeKind::StructType => self.visit_struct_type(n),
            NodeKind::UnionType | NodeKind::UnionTypeDefinition => {
                Err(CompileError::internal("union types are not supported"))
            }
            NodeKind::FunctionDefinition => self.visit_function_definition(n),
            NodeKind::FunctionDeclaration => {
                self.visit_function_declaration(n)?;
                Ok(())
            }
            NodeKind::StatementList => self.visit_statement_list(n),
            NodeKind::StructTypeDefinition => self.visit_struct_type_definition(n),
            NodeKind::BinaryExpression => self.visit_binary_expression(n),
            NodeKind::UnaryExpression => self.visit_unary_expression(n),
            NodeKind::FunctionCallExpression => self.visit_function_call_expression(n),
            NodeKind::FieldRefExpression => self.visit_field_ref_expression(n),
            NodeKind::IndirectFieldRefExpression => self.visit_indirect_field_ref_expression(n),
            NodeKind::ArrayElementRefExpression => self.visit_array_element_ref_expression(n),
            NodeKind::VariableRef => self.visit_variable_ref(n),
            NodeKind::LiteralValue => self.visit_literal_value(n),
            NodeKind::ReturnStatement => self.visit_return_statement(n),
            NodeKind::ReturnExpressionStatement => self.visit_return_expression_statement(n),
            NodeKind::ExpressionStatement
            | NodeKind::WhileStatement
            | NodeKind::DoWhileStatement
            | NodeKind::ForStatement
            | NodeKind::IfStatement
            | NodeKind::IfElseStatement => self.visit_children(n),
            NodeKind::EmptyStatement | NodeKind::Token => Ok(()),
            NodeKind::ImplicitConversion => {
                // created by this pass, already annotated
                Ok(())
            }
            _ => Err(CompileError::internal(format!(
                "unexpected AST node {} in semantic analysis",
                n.kind
            ))),
        }
    }

    fn visit_children(&mut self, n: &mut Node) -> Result<()> {
        for kid in &mut n.kids {
            self.visit(kid)?;
        }
        Ok(())
    }

    /* Scopes */

    fn enter_scope(&mut self, name: &str) {
        let scope = SymbolTable::new(Some(self.current.clone()), name);
        self.current = Rc::new(RefCell::new(scope));
    }

    fn leave_scope(&mut self) {
        let parent = self.current.borrow().parent().expect("left the root scope");
        self.current = parent;
    }

    /* Types */

    fn visit_basic_type(&mut self, n: &mut Node) -> Result<()> {
        let loc = n.loc.clone();

        let mut kind = None;
        let mut length = None;
        let mut signedness = None;
        let mut is_const = false;
        let mut is_volatile = false;

        for kid in &n.kids {
            let TokenKind::Keyword(keyword) = kid.token_kind() else {
                unreachable!("basic type children are keyword tokens");
            };
            match keyword {
                Keyword::Void | Keyword::Char | Keyword::Int => {
                    let this = match keyword {
                        Keyword::Void => BasicTypeKind::Void,
                        Keyword::Char => BasicTypeKind::Char,
                        _ => BasicTypeKind::Int,
                    };
                    if kind.replace(this).is_some() {
                        return Err(CompileError::semantic(loc, "conflicting type specifiers"));
                    }
                }
                Keyword::Short | Keyword::Long => {
                    if length.replace(keyword).is_some() {
                        return Err(CompileError::semantic(
                            loc,
                            "conflicting length specifiers",
                        ));
                    }
                }
                Keyword::Signed | Keyword::Unsigned => {
                    if signedness.replace(keyword).is_some() {
                        return Err(CompileError::semantic(
                            loc,
                            "cannot combine signed and unsigned",
                        ));
                    }
                }
                Keyword::Const => is_const = true,
                Keyword::Volatile => is_volatile = true,
                _ => unreachable!("non-specifier keyword in basic type"),
            }
        }

        if kind == Some(BasicTypeKind::Void) {
            if length.is_some() || signedness.is_some() || is_const || is_volatile {
                return Err(CompileError::semantic(
                    loc,
                    "void type cannot have qualifiers",
                ));
            }
            n.set_type(Type::basic(BasicTypeKind::Void, true));
            return Ok(());
        }

        if kind == Some(BasicTypeKind::Char) && length.is_some() {
            return Err(CompileError::semantic(
                loc,
                "cannot combine char with long or short",
            ));
        }

        let kind = match length {
            Some(Keyword::Short) => BasicTypeKind::Short,
            Some(Keyword::Long) => BasicTypeKind::Long,
            _ => kind.unwrap_or(BasicTypeKind::Int),
        };
        let is_signed = signedness != Some(Keyword::Unsigned);

        let mut ty = Type::basic(kind, is_signed);
        if is_volatile {
            ty = Type::qualified(ty, TypeQualifier::Volatile);
        }
        if is_const {
            ty = Type::qualified(ty, TypeQualifier::Const);
        }
        n.set_type(ty);
        Ok(())
    }

    fn visit_struct_type(&mut self, n: &mut Node) -> Result<()> {
        let key = format!("struct {}", n.str());
        match self.current.borrow().lookup_recursive(&key) {
            Some(symbol) => {
                n.ty = Some(symbol.borrow().ty.clone());
                Ok(())
            }
            None => Err(CompileError::semantic(
                n.loc.clone(),
                format!("unknown struct type '{}'", n.str()),
            )),
        }
    }

    /// Walk a declarator chain top-down, wrapping the base type at each
    /// pointer or array layer; the named leaf receives the complete type,
    /// which is then hoisted (with the name) onto every enclosing declarator.
    fn visit_declarator(&mut self, declarator: &mut Node, base: Rc<Type>) -> Result<()> {
        match declarator.kind {
            NodeKind::NamedDeclarator => {
                declarator.set_type(base);
                Ok(())
            }
            NodeKind::PointerDeclarator => {
                self.visit_declarator(declarator.kid_mut(0), Type::pointer(base))?;
                self.hoist_from_inner(declarator);
                Ok(())
            }
            NodeKind::ArrayDeclarator => {
                let length: u64 = declarator.kid(1).str().parse().map_err(|_| {
                    CompileError::semantic(declarator.loc.clone(), "invalid array length")
                })?;
                self.visit_declarator(declarator.kid_mut(0), Type::array(base, length))?;
                self.hoist_from_inner(declarator);
                Ok(())
            }
            _ => Err(CompileError::internal(format!(
                "unexpected declarator node {}",
                declarator.kind
            ))),
        }
    }

    fn hoist_from_inner(&self, declarator: &mut Node) {
        declarator.ty = declarator.kid(0).ty.clone();
        declarator.lexeme = declarator.kid(0).lexeme.clone();
    }

    /* Declarations */

    fn visit_variable_declaration(&mut self, n: &mut Node) -> Result<()> {
        self.visit(n.kid_mut(0))?;
        let base = n.kid(0).ty();

        let loc = n.loc.clone();
        for declarator in &mut n.kid_mut(1).kids {
            self.visit_declarator(declarator, base.clone())?;
            let name = declarator.str().to_owned();
            let ty = declarator.ty();

            if self.current.borrow().has_symbol_local(&name) {
                return Err(CompileError::semantic(
                    loc.clone(),
                    format!("variable '{name}' is already defined"),
                ));
            }
            let symbol = self
                .current
                .borrow_mut()
                .define(SymbolKind::Variable, &name, ty);
            declarator.set_symbol(symbol);

            if let Some(init_index) = declarator.declarator_initializer_index() {
                // globals are emitted as zeroed .space blocks
                if self.current.borrow().parent().is_none() {
                    return Err(CompileError::semantic(
                        loc.clone(),
                        "initializers on global variables are not supported",
                    ));
                }
                self.visit(declarator.kid_mut(init_index))?;
                Self::check_initializer(declarator, init_index)?;
            }
        }
        Ok(())
    }

    /// Initializers follow the assignment compatibility rules, minus the
    /// lvalue and const checks (initializing a const variable is the one way
    /// to give it a value).
    fn check_initializer(declarator: &mut Node, init_index: usize) -> Result<()> {
        let loc = declarator.loc.clone();
        let target = declarator.ty();
        let init = declarator.kid(init_index).ty();

        if target.is_array() {
            return Err(CompileError::semantic(loc, "array initializers are not supported"));
        }
        if target.is_pointer() && !(init.is_pointer() || init.is_array()) {
            return Err(CompileError::semantic(
                loc,
                "initialization of pointer from non-pointer",
            ));
        }
        if init.is_pointer() && !target.is_pointer() {
            return Err(CompileError::semantic(
                loc,
                "initialization of non-pointer from pointer",
            ));
        }
        if target.is_struct() != init.is_struct()
            || (target.is_struct() && !target.is_same(&init))
        {
            return Err(CompileError::semantic(
                loc,
                "initializer has incompatible struct type",
            ));
        }
        if target.is_integral() {
            if !init.is_integral() {
                return Err(CompileError::semantic(
                    loc,
                    "initialization of integer from non-integer",
                ));
            }
            if target.basic_type_kind() != init.basic_type_kind() {
                let converted = Type::basic(target.basic_type_kind(), init.is_signed());
                Self::wrap_in_conversion(declarator, init_index, converted);
            }
        }
        Ok(())
    }

    fn visit_struct_type_definition(&mut self, n: &mut Node) -> Result<()> {
        let name = n.str().to_owned();
        let key = format!("struct {name}");
        if self.current.borrow().has_symbol_recursive(&key) {
            return Err(CompileError::semantic(
                n.loc.clone(),
                format!("struct '{name}' is already defined"),
            ));
        }

        let struct_type = Type::struct_type(&name);
        self.current
            .borrow_mut()
            .define(SymbolKind::Type, &key, struct_type.clone());

        self.enter_scope("struct");
        let result = self.visit_children(n.kid_mut(1));
        if result.is_ok() {
            for symbol in self.current.borrow().symbols() {
                let symbol = symbol.borrow();
                struct_type.add_struct_member(Member::new(&symbol.name, symbol.ty.clone()));
            }
        }
        self.leave_scope();
        result?;

        n.set_type(struct_type);
        Ok(())
    }

    /* Functions */

    fn visit_function_declaration(&mut self, n: &mut Node) -> Result<SymbolRef> {
        self.visit(n.kid_mut(0))?;
        let base = n.kid(0).ty();
        self.visit_declarator(n.kid_mut(1), base)?;
        let return_type = n.kid(1).ty();

        let mut members = Vec::new();
        for param in &mut n.kid_mut(3).kids {
            self.visit_function_parameter(param)?;
            let symbol = param.symbol();
            let symbol = symbol.borrow();
            members.push(Member::new(&symbol.name, symbol.ty.clone()));
        }

        let fn_type = Type::function(return_type, members);
        let name = n.str().to_owned();

        let existing = self.current.borrow().lookup_local(&name);
        let symbol = match existing {
            Some(symbol) => {
                let compatible = {
                    let s = symbol.borrow();
                    s.kind == SymbolKind::Function && !s.is_defined && s.ty.is_same(&fn_type)
                };
                if !compatible {
                    return Err(CompileError::semantic(
                        n.loc.clone(),
                        format!("'{name}' is already defined in this scope"),
                    ));
                }
                symbol
            }
            None => self
                .current
                .borrow_mut()
                .declare(SymbolKind::Function, &name, fn_type.clone()),
        };

        n.set_type(fn_type);
        n.set_symbol(symbol.clone());
        Ok(symbol)
    }

    fn visit_function_parameter(&mut self, n: &mut Node) -> Result<()> {
        self.visit(n.kid_mut(0))?;
        let base = n.kid(0).ty();
        self.visit_declarator(n.kid_mut(1), base)?;

        let name = n.kid(1).str().to_owned();
        let mut ty = n.kid(1).ty();
        // array parameters decay to pointers
        if ty.is_array() {
            ty = Type::pointer(ty.base_type());
        }

        n.lexeme = Some(name.clone());
        n.set_type(ty.clone());

        // the symbol is defined into the function scope later; build it here
        // so the parameter node carries it
        let symbol = Rc::new(RefCell::new(Symbol::variable(&name, ty)));
        n.set_symbol(symbol);
        Ok(())
    }

    fn visit_function_definition(&mut self, n: &mut Node) -> Result<()> {
        let symbol = self.visit_function_declaration(n)?;
        symbol.borrow_mut().is_defined = true;

        let name = n.str().to_owned();
        self.enter_scope(&name);

        let result = (|| {
            for param in &n.kid(3).kids {
                let param_symbol = param.symbol();
                let param_name = param_symbol.borrow().name.clone();
                if self.current.borrow().has_symbol_local(&param_name) {
                    return Err(CompileError::semantic(
                        param.loc.clone(),
                        format!("duplicate parameter name '{param_name}'"),
                    ));
                }
                self.current.borrow_mut().define_symbol(param_symbol);
            }
            Ok(())
        })();

        let result = result.and_then(|_| self.visit(n.kid_mut(4)));
        self.leave_scope();
        result
    }

    fn visit_statement_list(&mut self, n: &mut Node) -> Result<()> {
        let name = self.current.borrow().name().to_owned();
        self.enter_scope(&name);
        let result = self.visit_children(n);
        self.leave_scope();
        result
    }

    /* Expressions */

    fn visit_binary_expression(&mut self, n: &mut Node) -> Result<()> {
        self.visit(n.kid_mut(1))?;
        self.visit(n.kid_mut(2))?;

        let op = n.kid(0).token_kind();
        match op {
            TokenKind::Equals => self.check_assignment(n)?,
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Asterisk
            | TokenKind::Divide
            | TokenKind::Modulus => self.check_arithmetic(n)?,
            TokenKind::LessThan
            | TokenKind::LessThanOrEqualTo
            | TokenKind::GreaterThan
            | TokenKind::GreaterThanOrEqualTo
            | TokenKind::DoubleEquals
            | TokenKind::NotEquals
            | TokenKind::LogicalAnd
            | TokenKind::LogicalOr => self.check_comparison(n)?,
            _ => {
                return Err(CompileError::internal(format!(
                    "unexpected binary operator {op:?}"
                )));
            }
        }
        Ok(())
    }

    fn is_lvalue(n: &Node) -> bool {
        if n.has_symbol() {
            return true;
        }
        match n.kind {
            NodeKind::FieldRefExpression
            | NodeKind::IndirectFieldRefExpression
            | NodeKind::ArrayElementRefExpression => true,
            NodeKind::UnaryExpression => n.kid(0).token_kind() == TokenKind::Asterisk,
            _ => false,
        }
    }

    fn check_assignment(&mut self, n: &mut Node) -> Result<()> {
        let loc = n.loc.clone();
        let lhs = n.kid(1).ty();
        let rhs = n.kid(2).ty();

        if !Self::is_lvalue(n.kid(1)) {
            return Err(CompileError::semantic(loc, "assignment to non-lvalue"));
        }
        if lhs.is_const() {
            return Err(CompileError::semantic(
                loc,
                "assignment to const-qualified lvalue",
            ));
        }
        if lhs.is_array() {
            return Err(CompileError::semantic(loc, "assignment to array"));
        }
        if rhs.is_volatile() && !lhs.is_volatile() {
            return Err(CompileError::semantic(
                loc,
                "assignment of volatile value to non-volatile lvalue",
            ));
        }

        if lhs.is_pointer() && !(rhs.is_pointer() || rhs.is_array()) {
            return Err(CompileError::semantic(
                loc,
                "assignment of non-pointer to pointer",
            ));
        }
        if rhs.is_pointer() && !lhs.is_pointer() {
            return Err(CompileError::semantic(
                loc,
                "assignment of pointer to non-pointer",
            ));
        }

        if lhs.is_struct() != rhs.is_struct() {
            return Err(CompileError::semantic(
                loc,
                "assignment between struct and non-struct",
            ));
        }
        if lhs.is_struct() && !lhs.is_same(&rhs) {
            return Err(CompileError::semantic(
                loc,
                "assignment between different struct types",
            ));
        }

        if lhs.is_integral() {
            if !rhs.is_integral() {
                return Err(CompileError::semantic(
                    loc,
                    "assignment of non-integer to integer",
                ));
            }
            // mixed-width integer assignment converts the source to the
            // destination width so the move is consistently sized
            if lhs.basic_type_kind() != rhs.basic_type_kind() {
                let target = Type::basic(lhs.basic_type_kind(), rhs.is_signed());
                Self::wrap_in_conversion(n, 2, target);
            }
        }

        n.set_type(lhs);
        Ok(())
    }

    fn check_arithmetic(&mut self, n: &mut Node) -> Result<()> {
        let loc = n.loc.clone();

        if n.kid(1).ty().is_void() || n.kid(2).ty().is_void() {
            return Err(CompileError::semantic(loc, "arithmetic on void type"));
        }
        if n.kid(2).ty().is_pointer() && !n.kid(1).ty().is_pointer() {
            return Err(CompileError::semantic(
                loc,
                "pointer on right-hand side of arithmetic",
            ));
        }
        if n.kid(1).ty().is_struct() || n.kid(2).ty().is_struct() {
            return Err(CompileError::semantic(loc, "arithmetic on struct type"));
        }

        if n.kid(1).ty().is_pointer() || n.kid(1).ty().is_array() {
            // pointer +/- integer
            if !n.kid(2).ty().is_integral() {
                return Err(CompileError::semantic(
                    loc,
                    "pointer arithmetic requires an integer operand",
                ));
            }
            let result = n.kid(1).ty();
            n.set_type(result);
            return Ok(());
        }

        let result = Self::usual_arithmetic_conversions(n);
        n.set_type(result);
        Ok(())
    }

    fn check_comparison(&mut self, n: &mut Node) -> Result<()> {
        let loc = n.loc.clone();
        let lhs = n.kid(1).ty();
        let rhs = n.kid(2).ty();

        if lhs.is_pointer() != rhs.is_pointer() {
            return Err(CompileError::semantic(
                loc,
                "comparison between pointer and non-pointer",
            ));
        }
        if lhs.is_struct() != rhs.is_struct() {
            return Err(CompileError::semantic(
                loc,
                "comparison between struct and non-struct",
            ));
        }
        if lhs.is_function() != rhs.is_function() {
            return Err(CompileError::semantic(
                loc,
                "comparison between function and non-function",
            ));
        }

        if lhs.is_integral() && rhs.is_integral() {
            Self::usual_arithmetic_conversions(n);
        }

        n.set_type(Type::basic(BasicTypeKind::Int, true));
        Ok(())
    }

    /// Promote char/short operands to int, then widen the narrower operand so
    /// both sides of a binary operation have the same size. Returns the
    /// common type.
    fn usual_arithmetic_conversions(n: &mut Node) -> Rc<Type> {
        for i in [1, 2] {
            let ty = n.kid(i).ty();
            if ty.is_integral() && ty.basic_type_kind() < BasicTypeKind::Int {
                Self::wrap_in_conversion(n, i, Type::basic(BasicTypeKind::Int, ty.is_signed()));
            }
        }

        let lhs = n.kid(1).ty();
        let rhs = n.kid(2).ty();
        if !lhs.is_integral() || !rhs.is_integral() {
            return lhs;
        }

        let kind = lhs.basic_type_kind().max(rhs.basic_type_kind());
        let is_signed = lhs.is_signed() && rhs.is_signed();
        let common = Type::basic(kind, is_signed);

        if lhs.basic_type_kind() != kind {
            Self::wrap_in_conversion(n, 1, common.clone());
        }
        if rhs.basic_type_kind() != kind {
            Self::wrap_in_conversion(n, 2, common.clone());
        }
        common
    }

    fn wrap_in_conversion(n: &mut Node, kid: usize, ty: Rc<Type>) {
        let loc = n.kid(kid).loc.clone();
        let placeholder = Node::new(NodeKind::EmptyStatement, loc.clone(), vec![]);
        let original = mem::replace(n.kid_mut(kid), placeholder);
        let mut conversion = Node::new(NodeKind::ImplicitConversion, loc, vec![original]);
        conversion.set_type(ty);
        n.kids[kid] = conversion;
    }

    fn visit_unary_expression(&mut self, n: &mut Node) -> Result<()> {
        self.visit(n.kid_mut(1))?;
        let loc = n.loc.clone();
        let op = n.kid(0).token_kind();

        match op {
            TokenKind::Ampersand => {
                if n.kid(1).kind == NodeKind::LiteralValue {
                    return Err(CompileError::semantic(loc, "cannot take address of a literal"));
                }
                if !Self::is_lvalue(n.kid(1)) {
                    return Err(CompileError::semantic(
                        loc,
                        "cannot take address of a non-lvalue",
                    ));
                }
                if n.kid(1).has_symbol() {
                    n.kid(1).symbol().borrow_mut().address_taken = true;
                }
                n.set_type(Type::pointer(n.kid(1).ty()));
            }
            TokenKind::Asterisk => {
                let operand = n.kid(1).ty();
                if !operand.is_pointer() {
                    return Err(CompileError::semantic(loc, "dereference of non-pointer"));
                }
                n.set_type(operand.base_type());
            }
            TokenKind::Minus => {
                let operand = n.kid(1).ty();
                if !operand.is_integral() {
                    return Err(CompileError::semantic(
                        loc,
                        "unary minus on non-integer operand",
                    ));
                }
                if operand.basic_type_kind() < BasicTypeKind::Int {
                    Self::wrap_in_conversion(
                        n,
                        1,
                        Type::basic(BasicTypeKind::Int, operand.is_signed()),
                    );
                }
                n.ty = n.kid(1).ty.clone();
            }
            _ => {
                return Err(CompileError::internal(format!(
                    "unexpected unary operator {op:?}"
                )));
            }
        }
        Ok(())
    }

    fn visit_function_call_expression(&mut self, n: &mut Node) -> Result<()> {
        let loc = n.loc.clone();

        let name = n.kid(0).str().to_owned();
        let Some(symbol) = self.current.borrow().lookup_recursive(&name) else {
            return Err(CompileError::semantic(
                loc,
                format!("function '{name}' does not exist"),
            ));
        };
        let fn_type = symbol.borrow().ty.clone();
        if !fn_type.is_function() {
            return Err(CompileError::semantic(
                loc,
                format!("called object '{name}' is not a function"),
            ));
        }
        n.kid_mut(0).set_symbol(symbol.clone());

        let num_params = fn_type.num_members();
        if num_params != n.kid(1).kids.len() {
            return Err(CompileError::semantic(
                loc,
                format!(
                    "function '{name}' expects {num_params} arguments, {} given",
                    n.kid(1).kids.len()
                ),
            ));
        }

        let args = n.kid_mut(1);
        for i in 0..num_params {
            self.visit(args.kid_mut(i))?;
            let arg = args.kid(i).ty();
            let param = fn_type.members()[i].ty.clone();

            if !Self::argument_compatible(&arg, &param) {
                return Err(CompileError::semantic(
                    args.kid(i).loc.clone(),
                    format!("argument {} has incompatible type for '{name}'", i + 1),
                ));
            }
            // size the argument move by the parameter type
            if arg.is_integral()
                && param.is_integral()
                && arg.basic_type_kind() != param.basic_type_kind()
            {
                Self::wrap_in_conversion(
                    args,
                    i,
                    Type::basic(param.basic_type_kind(), arg.is_signed()),
                );
            }
        }

        n.set_symbol(symbol);
        n.set_type(fn_type.base_type());
        Ok(())
    }

    fn argument_compatible(arg: &Type, param: &Type) -> bool {
        if param.is_pointer() {
            // arrays decay to pointers at call boundaries
            return arg.is_pointer() || arg.is_array();
        }
        if param.is_struct() {
            return arg.is_struct() && arg.is_same(param);
        }
        if param.is_integral() {
            return arg.is_integral();
        }
        arg.is_same(param)
    }

    fn visit_field_ref_expression(&mut self, n: &mut Node) -> Result<()> {
        self.visit(n.kid_mut(0))?;
        let loc = n.loc.clone();
        let object = n.kid(0).ty();

        if object.is_pointer() {
            return Err(CompileError::semantic(
                loc,
                "'.' applied to a pointer (use '->')",
            ));
        }
        if !object.is_struct() {
            return Err(CompileError::semantic(loc, "'.' applied to a non-struct"));
        }

        let field = n.kid(1).str();
        let Some(member) = object.find_member(field) else {
            return Err(CompileError::semantic(
                loc,
                format!("struct has no member named '{field}'"),
            ));
        };

        // arrays of char decay to pointer-to-char on access
        if member.ty.is_array()
            && member.ty.base_type().is_integral()
            && member.ty.base_type().basic_type_kind() == BasicTypeKind::Char
        {
            n.set_type(Type::pointer(member.ty.base_type()));
        } else {
            n.set_type(member.ty.clone());
        }
        Ok(())
    }

    fn visit_indirect_field_ref_expression(&mut self, n: &mut Node) -> Result<()> {
        self.visit(n.kid_mut(0))?;
        let loc = n.loc.clone();
        let object = n.kid(0).ty();

        if !object.is_pointer() {
            return Err(CompileError::semantic(loc, "'->' applied to a non-pointer"));
        }
        let pointee = object.base_type();
        if !pointee.is_struct() {
            return Err(CompileError::semantic(
                loc,
                "'->' applied to a pointer to non-struct",
            ));
        }

        let field = n.kid(1).str();
        let Some(member) = pointee.find_member(field) else {
            return Err(CompileError::semantic(
                loc,
                format!("struct has no member named '{field}'"),
            ));
        };
        n.set_type(member.ty.clone());
        Ok(())
    }

    fn visit_array_element_ref_expression(&mut self, n: &mut Node) -> Result<()> {
        self.visit(n.kid_mut(0))?;
        self.visit(n.kid_mut(1))?;
        let loc = n.loc.clone();

        let object = n.kid(0).ty();
        if !(object.is_pointer() || object.is_array()) {
            return Err(CompileError::semantic(
                loc,
                "subscripted value is not a pointer or array",
            ));
        }
        if !n.kid(1).ty().is_integral() {
            return Err(CompileError::semantic(loc, "array index is not an integer"));
        }

        n.set_type(object.base_type());
        Ok(())
    }

    fn visit_variable_ref(&mut self, n: &mut Node) -> Result<()> {
        let name = n.str().to_owned();
        let symbol = {
            let scope = self.current.borrow();
            scope
                .lookup_recursive(&name)
                // fallback for struct-type expressions
                .or_else(|| scope.lookup_recursive(&format!("struct {name}")))
        };
        let Some(symbol) = symbol else {
            return Err(CompileError::semantic(
                n.loc.clone(),
                format!("'{name}' is not defined"),
            ));
        };

        n.ty = Some(symbol.borrow().ty.clone());
        n.set_symbol(symbol);
        Ok(())
    }

    fn visit_literal_value(&mut self, n: &mut Node) -> Result<()> {
        let token = n.kid(0);
        match token.token_kind() {
            TokenKind::IntLiteral => {
                let literal = LiteralValue::from_int_literal(token.str(), &token.loc)?;
                let kind = if literal.is_long() {
                    BasicTypeKind::Long
                } else {
                    BasicTypeKind::Int
                };
                n.set_type(Type::basic(kind, !literal.is_unsigned()));
                n.literal = Some(literal);
            }
            TokenKind::CharLiteral => {
                n.literal = Some(LiteralValue::from_char_literal(token.str()));
                n.set_type(Type::basic(BasicTypeKind::Char, true));
            }
            TokenKind::StrLiteral => {
                n.literal = Some(LiteralValue::from_str_literal(token.str()));
                n.set_type(Type::pointer(Type::basic(BasicTypeKind::Char, true)));
            }
            other => {
                return Err(CompileError::internal(format!(
                    "unexpected literal token {other:?}"
                )));
            }
        }
        Ok(())
    }

    /* Returns */

    fn enclosing_function_type(&self) -> Option<Rc<Type>> {
        let scope_name = self.current.borrow().name().to_owned();
        self.current
            .borrow()
            .lookup_recursive_of_kind(&scope_name, SymbolKind::Function)
            .map(|symbol| symbol.borrow().ty.clone())
    }

    fn visit_return_statement(&mut self, n: &mut Node) -> Result<()> {
        let Some(fn_type) = self.enclosing_function_type() else {
            return Err(CompileError::semantic(
                n.loc.clone(),
                "return outside of a function",
            ));
        };
        if !fn_type.base_type().is_void() {
            return Err(CompileError::semantic(
                n.loc.clone(),
                "return with no value in a function returning non-void",
            ));
        }
        Ok(())
    }

    fn visit_return_expression_statement(&mut self, n: &mut Node) -> Result<()> {
        self.visit(n.kid_mut(0))?;

        let Some(fn_type) = self.enclosing_function_type() else {
            return Err(CompileError::semantic(
                n.loc.clone(),
                "return outside of a function",
            ));
        };
        let return_type = fn_type.base_type();
        if !return_type.is_same(&n.kid(0).ty()) {
            return Err(CompileError::semantic(
                n.loc.clone(),
                "return value does not match the function's return type",
            ));
        }
        Ok(())
    }
}

impl Default for SemanticAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{SourceFile, SourceFileOrigin, parser::Parser};
    use indoc::indoc;

    fn analyze(source: &str) -> Result<(Node, SemanticAnalysis)> {
        let source = SourceFile {
            contents: source.to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        let mut unit = Parser::parse_unit(&source)?;
        let mut sema = SemanticAnalysis::new();
        sema.visit(&mut unit)?;
        Ok((unit, sema))
    }

    fn analyze_err(source: &str) -> String {
        match analyze(source) {
            Ok(_) => panic!("expected a semantic error"),
            Err(error) => error.to_string(),
        }
    }

    /// Symbol of the declaration at `decl_index` in `fn_index`'s body.
    fn local_symbol(unit: &Node, fn_index: usize, decl_index: usize) -> SymbolRef {
        unit.kid(fn_index).kid(4).kid(decl_index).kid(1).kid(0).symbol()
    }

    #[test]
    fn accepts_a_minimal_program() {
        analyze("int main(void) { return 0; }").unwrap();
    }

    #[test]
    fn rejects_duplicate_global() {
        let message = analyze_err("int x; int x;");
        assert!(message.contains("already defined"), "{message}");
    }

    #[test]
    fn rejects_address_of_literal() {
        let message = analyze_err(indoc! {"
            int main(void) {
                int x;
                x = &3;
                return 0;
            }
        "});
        assert!(message.contains("literal"), "{message}");
    }

    #[test]
    fn rejects_array_assignment() {
        let message = analyze_err(indoc! {"
            int main(void) {
                int a[3];
                int b[3];
                a = b;
                return 0;
            }
        "});
        assert!(message.contains("array"), "{message}");
    }

    #[test]
    fn rejects_assignment_to_const() {
        let message = analyze_err(indoc! {"
            int main(void) {
                const int c = 0;
                c = 1;
                return 0;
            }
        "});
        assert!(message.contains("const"), "{message}");
    }

    #[test]
    fn const_initializer_is_allowed() {
        analyze("int main(void) { const int c = 0; return c; }").unwrap();
    }

    #[test]
    fn rejects_void_with_qualifiers() {
        let message = analyze_err("const void x;");
        assert!(message.contains("void"), "{message}");
    }

    #[test]
    fn rejects_conflicting_specifiers() {
        assert!(analyze_err("signed unsigned int x;").contains("signed"));
        assert!(analyze_err("long char x;").contains("char"));
    }

    #[test]
    fn rejects_undefined_identifier() {
        let message = analyze_err("int main(void) { return y; }");
        assert!(message.contains("not defined"), "{message}");
    }

    #[test]
    fn rejects_dereference_of_non_pointer() {
        let message = analyze_err(indoc! {"
            int main(void) {
                int x;
                return *x;
            }
        "});
        assert!(message.contains("non-pointer"), "{message}");
    }

    #[test]
    fn rejects_wrong_member_access_operator() {
        let program_dot = indoc! {"
            struct P { int x; };
            int main(void) {
                struct P *p;
                return p.x;
            }
        "};
        assert!(analyze_err(program_dot).contains("'->'"));

        let program_arrow = indoc! {"
            struct P { int x; };
            int main(void) {
                struct P p;
                return p->x;
            }
        "};
        assert!(analyze_err(program_arrow).contains("non-pointer"));
    }

    #[test]
    fn rejects_unknown_struct_and_missing_member() {
        assert!(analyze_err("int main(void) { struct Q q; return 0; }").contains("unknown struct"));

        let program = indoc! {"
            struct P { int x; };
            int main(void) {
                struct P p;
                return p.z;
            }
        "};
        assert!(analyze_err(program).contains("no member"));
    }

    #[test]
    fn rejects_argument_count_mismatch() {
        let message = analyze_err(indoc! {"
            int add(int a, int b) { return a + b; }
            int main(void) { return add(1); }
        "});
        assert!(message.contains("arguments"), "{message}");
    }

    #[test]
    fn rejects_return_type_mismatch() {
        let message = analyze_err(indoc! {"
            struct P { int x; };
            struct P f(void);
            int main(void) {
                struct P p;
                return p;
            }
        "});
        assert!(message.contains("return"), "{message}");
    }

    #[test]
    fn rejects_pointer_comparison_with_integer() {
        let message = analyze_err(indoc! {"
            int main(void) {
                int x;
                int *p;
                p = &x;
                if (p == 1) return 1;
                return 0;
            }
        "});
        assert!(message.contains("comparison"), "{message}");
    }

    #[test]
    fn address_of_marks_the_symbol() {
        let (unit, _) = analyze(indoc! {"
            int main(void) {
                int x;
                int *p;
                p = &x;
                return x;
            }
        "})
        .unwrap();

        let x = local_symbol(&unit, 0, 0);
        assert!(x.borrow().address_taken);
        let p = local_symbol(&unit, 0, 1);
        assert!(!p.borrow().address_taken);
    }

    #[test]
    fn arithmetic_promotes_small_operands() {
        let (unit, _) = analyze(indoc! {"
            int main(void) {
                char c;
                c = 'a';
                return c + 1;
            }
        "})
        .unwrap();

        // return expression: c + 1 with c wrapped in an implicit conversion
        let ret = unit.kid(0).kid(4).kid(2);
        let sum = ret.kid(0);
        assert_eq!(sum.kid(1).kind, NodeKind::ImplicitConversion);
        assert_eq!(sum.kid(1).ty().basic_type_kind(), BasicTypeKind::Int);
    }

    #[test]
    fn declarator_nesting_reads_correctly() {
        let (unit, _) = analyze(indoc! {"
            int main(void) {
                int *a[3];
                int (*b)[3];
                return 0;
            }
        "})
        .unwrap();

        let a = local_symbol(&unit, 0, 0);
        let a_ty = a.borrow().ty.clone();
        assert!(a_ty.is_array());
        assert!(a_ty.base_type().is_pointer());

        let b = local_symbol(&unit, 0, 1);
        let b_ty = b.borrow().ty.clone();
        assert!(b_ty.is_pointer());
        assert!(b_ty.base_type().is_array());
    }

    #[test]
    fn struct_definition_layout() {
        let (_, sema) = analyze(indoc! {"
            struct P { int x; int y; };
            int main(void) {
                struct P p;
                p.x = 3;
                return p.x;
            }
        "})
        .unwrap();

        let global = sema.global_symtab();
        let p = global.borrow().lookup_local("struct P").unwrap();
        let ty = p.borrow().ty.clone();
        ty.layout_struct();
        assert_eq!(ty.storage_size(), 8);
        assert_eq!(ty.find_member("y").unwrap().offset(), 4);
    }

    #[test]
    fn scopes_do_not_leak_between_functions() {
        // same-named locals in two functions and in nested blocks
        analyze(indoc! {"
            int f(void) { int v; v = 1; return v; }
            int g(void) { int v; v = 2; { int v; v = 3; } return v; }
        "})
        .unwrap();
    }

    #[test]
    fn duplicate_parameter_names_are_rejected() {
        let message = analyze_err("int f(int a, int a) { return a; }");
        assert!(message.contains("parameter"), "{message}");
    }

    #[test]
    fn volatile_source_requires_volatile_destination() {
        let message = analyze_err(indoc! {"
            int main(void) {
                volatile int v;
                int x;
                x = v;
                return x;
            }
        "});
        assert!(message.contains("volatile"), "{message}");
    }
}
