//! Single-pass compiler
//!
//! A Pratt parser that consumes the buffered token list and emits bytecode
//! straight into the current function's chunk, resolving every name at
//! emit time. Functions nest: each one gets its own compiler frame with
//! its locals and upvalues, linked to the enclosing frame so upvalue
//! resolution can recurse outward.
//!
//! Statements end at one-or-more newlines (or a `;`); a closing `end`,
//! an `else`, or end-of-input also terminates the statement before it, so
//! short bodies can share a line. The first error switches the parser
//! into panic mode, which suppresses cascades until the next statement
//! boundary.

use crate::chunk::OpCode;
use crate::error::{compile_error_header, source_excerpt};
use crate::heap::{Heap, ObjId};
use crate::object::{EnumObject, Function, ObjectKind};
use crate::scanner::{Token, TokenKind, scan_source};
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: u8 = 16;

// Hidden loop variables; a space keeps them out of the user's namespace.
const HIDDEN_SEQ: &str = "seq ";
const HIDDEN_ITER: &str = "iter ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Power,
    Unary,
    Call,
    Subscript,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Power,
            Precedence::Power => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Subscript,
            Precedence::Subscript => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src> = fn(&mut Compiler<'src>, bool);

struct ParseRule<'src> {
    prefix: Option<ParseFn<'src>>,
    infix: Option<ParseFn<'src>>,
    precedence: Precedence,
}

fn get_rule<'src>(kind: TokenKind) -> ParseRule<'src> {
    use Precedence as P;
    let (prefix, infix, precedence): (Option<ParseFn<'src>>, Option<ParseFn<'src>>, Precedence) = match kind {
        TokenKind::LeftParen => (Some(Compiler::grouping), Some(Compiler::call), P::Call),
        TokenKind::LeftBracket => (Some(Compiler::list), Some(Compiler::subscript), P::Subscript),
        TokenKind::Dot => (None, Some(Compiler::dot), P::Call),
        TokenKind::DotDot => (None, Some(Compiler::binary), P::Comparison),
        TokenKind::Minus => (Some(Compiler::unary), Some(Compiler::binary), P::Term),
        TokenKind::Plus => (None, Some(Compiler::binary), P::Term),
        TokenKind::Slash => (None, Some(Compiler::binary), P::Factor),
        TokenKind::SlashSlash => (None, Some(Compiler::binary), P::Factor),
        TokenKind::Star => (None, Some(Compiler::binary), P::Factor),
        TokenKind::StarStar => (None, Some(Compiler::binary), P::Power),
        TokenKind::Bang => (Some(Compiler::unary), None, P::None),
        TokenKind::BangEq => (None, Some(Compiler::binary), P::Equality),
        TokenKind::EqEq => (None, Some(Compiler::binary), P::Equality),
        TokenKind::Gt => (None, Some(Compiler::binary), P::Comparison),
        TokenKind::GtEq => (None, Some(Compiler::binary), P::Comparison),
        TokenKind::Lt => (None, Some(Compiler::binary), P::Comparison),
        TokenKind::LtEq => (None, Some(Compiler::binary), P::Comparison),
        TokenKind::Is => (None, Some(Compiler::is_expr), P::Comparison),
        TokenKind::And => (None, Some(Compiler::and_expr), P::And),
        TokenKind::Or => (None, Some(Compiler::or_expr), P::Or),
        TokenKind::Identifier => (Some(Compiler::variable), None, P::None),
        TokenKind::SelfKw => (Some(Compiler::self_expr), None, P::None),
        TokenKind::Str => (Some(Compiler::string), None, P::None),
        TokenKind::Number => (Some(Compiler::number), None, P::None),
        TokenKind::Null => (Some(Compiler::literal), None, P::None),
        TokenKind::True => (Some(Compiler::literal), None, P::None),
        TokenKind::False => (Some(Compiler::literal), None, P::None),
        _ => (None, None, P::None),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Constructor,
}

struct Local {
    name: String,
    // -1 while the initializer is still being compiled.
    depth: i32,
    captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

struct LoopContext {
    start: usize,
    scope_depth: i32,
    break_jumps: Vec<usize>,
}

/// Per-function compiler state; `enclosing` links outward for upvalue
/// resolution.
struct FunctionCompiler {
    enclosing: Option<Box<FunctionCompiler>>,
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
    loops: Vec<LoopContext>,
}

impl FunctionCompiler {
    fn new(kind: FunctionKind, name: Option<ObjId>) -> FunctionCompiler {
        // Slot zero belongs to the callee; in methods and constructors it
        // is the receiver and resolvable as `self`.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Constructor => "self",
            _ => "",
        };
        FunctionCompiler {
            enclosing: None,
            function: Function {
                chunk: crate::chunk::Chunk::new(),
                arity: 0,
                upvalue_count: 0,
                name,
            },
            kind,
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }

    fn resolve_local(&self, name: &str) -> Result<Option<u16>, &'static str> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err("Can't read local variable in its own initializer.");
                }
                return Ok(Some(i as u16));
            }
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u16, &'static str> {
        let reference = UpvalueRef { index, is_local };
        for (i, existing) in self.upvalues.iter().enumerate() {
            if *existing == reference {
                return Ok(i as u16);
            }
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        self.upvalues.push(reference);
        Ok((self.upvalues.len() - 1) as u16)
    }

    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u16>, &'static str> {
        let Some(enclosing) = self.enclosing.as_deref_mut() else {
            return Ok(None);
        };

        if let Some(local) = enclosing.resolve_local(name)? {
            enclosing.locals[local as usize].captured = true;
            return self.add_upvalue(local as u8, true).map(Some);
        }

        if let Some(upvalue) = enclosing.resolve_upvalue(name)? {
            return self.add_upvalue(upvalue as u8, false).map(Some);
        }

        Ok(None)
    }
}

struct ClassContext {
    name: String,
    has_constructor: bool,
}

struct Parser {
    tokens: Vec<Token>,
    offset: usize,
    previous: Token,
    current: Token,
    had_error: bool,
    panic_mode: bool,
}

pub struct Compiler<'src> {
    heap: &'src mut Heap,
    module: ObjId,
    source: &'src str,
    parser: Parser,
    current: Box<FunctionCompiler>,
    classes: Vec<ClassContext>,
    /// Upvalue pairs of the most recently finished function, consumed by
    /// the CLOSURE instruction that wraps it.
    pending_upvalues: Vec<UpvalueRef>,
}

/// Compile `source` against the module's existing globals. Returns the
/// top-level function, or `None` after reporting compile errors to
/// stderr.
pub fn compile(heap: &mut Heap, module: ObjId, source: &str) -> Option<ObjId> {
    let tokens = scan_source(source);
    let placeholder = Token {
        kind: TokenKind::Eof,
        lexeme: String::new(),
        line: 0,
    };

    let mut compiler = Compiler {
        heap,
        module,
        source,
        parser: Parser {
            tokens,
            offset: 0,
            previous: placeholder.clone(),
            current: placeholder,
            had_error: false,
            panic_mode: false,
        },
        current: Box::new(FunctionCompiler::new(FunctionKind::Script, None)),
        classes: Vec::new(),
        pending_upvalues: Vec::new(),
    };

    compiler.advance();
    compiler.skip_newlines();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
        compiler.terminate_statement();
        compiler.skip_newlines();
    }

    let had_error = compiler.parser.had_error;
    let function = compiler.finish_function();
    if had_error { None } else { Some(function) }
}

impl<'src> Compiler<'src> {
    // ---- token plumbing ----

    fn advance(&mut self) {
        self.parser.previous = self.parser.current.clone();

        loop {
            let token = self
                .parser
                .tokens
                .get(self.parser.offset)
                .cloned()
                .unwrap_or_else(|| Token {
                    kind: TokenKind::Eof,
                    lexeme: String::new(),
                    line: self.parser.previous.line,
                });
            self.parser.offset += 1;
            self.parser.current = token;

            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let message = self.parser.current.lexeme.clone();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Line) {
            self.advance();
        }
    }

    /// A statement ends at newline(s), a `;`, or right before a closing
    /// token so short bodies can sit on one line.
    fn terminate_statement(&mut self) {
        match self.parser.current.kind {
            TokenKind::Line | TokenKind::Semicolon => {
                self.advance();
                self.skip_newlines();
            }
            TokenKind::End | TokenKind::Else | TokenKind::Eof => {}
            _ => {
                self.error_at_current("Expect newline after statement.");
            }
        }
    }

    // ---- error reporting ----

    fn error_at(&mut self, at_current: bool, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        self.parser.had_error = true;

        let token = if at_current {
            &self.parser.current
        } else {
            &self.parser.previous
        };
        let at = match token.kind {
            TokenKind::Eof => "end".to_string(),
            TokenKind::Line => "end of line".to_string(),
            TokenKind::Error => String::new(),
            _ => token.lexeme.clone(),
        };

        eprintln!("{}", compile_error_header(token.line, &at, message));
        eprint!("{}", source_excerpt(self.source, token.line));
    }

    fn error(&mut self, message: &str) {
        self.error_at(false, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(true, message);
    }

    fn synchronize(&mut self) {
        self.parser.panic_mode = false;

        while self.parser.current.kind != TokenKind::Eof {
            if matches!(
                self.parser.previous.kind,
                TokenKind::Line | TokenKind::Semicolon
            ) {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Function
                | TokenKind::Var
                | TokenKind::Enum
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::End => return,
                _ => self.advance(),
            }
        }
    }

    // ---- emit helpers ----

    fn line(&self) -> u32 {
        self.parser.previous.line
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.current.function.chunk.write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.current.function.chunk.write(byte, line);
    }

    fn emit_short(&mut self, value: u16) {
        let line = self.line();
        self.current.function.chunk.write_short(value, line);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        match self.current.function.chunk.add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        if constant > 0xff {
            self.emit_op(OpCode::ConstantLong);
            self.emit_short(constant);
        } else {
            self.emit_op(OpCode::Constant);
            self.emit_byte(constant as u8);
        }
    }

    /// Intern an identifier and stash it in the constant pool.
    fn identifier_constant(&mut self, name: &str) -> u16 {
        let id = self.heap.intern(name);
        self.make_constant(Value::object(id))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_short(0xffff);
        self.current.function.chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current.function.chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        self.current.function.chunk.code[offset] = (jump >> 8) as u8;
        self.current.function.chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current.function.chunk.code.len() - start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
            self.emit_short(0);
            return;
        }
        self.emit_short(offset as u16);
    }

    fn emit_return(&mut self) {
        if self.current.kind == FunctionKind::Constructor {
            // Constructors always hand back the instance in slot zero.
            self.emit_op(OpCode::GetLocal);
            self.emit_short(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Seal the current function and allocate it on the heap.
    fn finish_function(&mut self) -> ObjId {
        self.emit_return();
        let mut finished = std::mem::replace(
            &mut self.current,
            Box::new(FunctionCompiler::new(FunctionKind::Script, None)),
        );
        if let Some(enclosing) = finished.enclosing.take() {
            self.current = enclosing;
        }
        finished.function.upvalue_count = finished.upvalues.len();
        let upvalues = finished.upvalues;
        let id = self.heap.alloc(ObjectKind::Function(finished.function));

        // Stash the upvalue pairs where emit_closure can reach them.
        self.pending_upvalues = upvalues;
        id
    }

    // ---- scopes and variables ----

    fn begin_scope(&mut self) {
        self.current.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current.scope_depth -= 1;
        while let Some(local) = self.current.locals.last() {
            if local.depth <= self.current.scope_depth {
                break;
            }
            if local.captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current.locals.pop();
        }
    }

    fn add_local(&mut self, name: &str) {
        if self.current.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current.locals.push(Local {
            name: name.to_string(),
            depth: -1,
            captured: false,
        });
    }

    fn declare_local(&mut self, name: &str) {
        for local in self.current.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.current.scope_depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                break;
            }
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let depth = self.current.scope_depth;
        if let Some(local) = self.current.locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Reserve (or find) the dense global slot for `name`. Re-declaring a
    /// global reuses its slot, which keeps the repl usable.
    fn declare_global(&mut self, name: &str) -> u16 {
        let name_id = self.heap.intern(name);
        let hash = self.heap.str_hash(name_id);
        let map = &mut self.heap.module_mut(self.module).global_map;
        if let Some(existing) = map.get(name_id, hash) {
            return existing.as_number() as u16;
        }
        let index = map.len();
        if index > u16::MAX as usize {
            self.error("Too many globals.");
            return 0;
        }
        self.heap
            .module_mut(self.module)
            .global_map
            .insert(name_id, hash, Value::number(index as f64));
        index as u16
    }

    fn resolve_global(&mut self, name: &str) -> Option<u16> {
        let name_id = self.heap.intern(name);
        let hash = self.heap.str_hash(name_id);
        self.heap
            .module(self.module)
            .global_map
            .get(name_id, hash)
            .map(|v| v.as_number() as u16)
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let (get_op, set_op, index) = match self.current.resolve_local(name) {
            Err(message) => {
                self.error(message);
                return;
            }
            Ok(Some(slot)) => (OpCode::GetLocal, OpCode::SetLocal, slot),
            Ok(None) => match self.current.resolve_upvalue(name) {
                Err(message) => {
                    self.error(message);
                    return;
                }
                Ok(Some(slot)) => (OpCode::GetUpvalue, OpCode::SetUpvalue, slot),
                Ok(None) => match self.resolve_global(name) {
                    Some(slot) => (OpCode::GetGlobal, OpCode::SetGlobal, slot),
                    None => {
                        self.error(&format!("Undefined variable '{name}'."));
                        return;
                    }
                },
            },
        };

        if can_assign && self.matches(TokenKind::Eq) {
            self.expression();
            self.emit_op(set_op);
        } else {
            self.emit_op(get_op);
        }
        self.emit_short(index);
    }

    // ---- expressions ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = get_rule(self.parser.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.parser.current.kind).precedence {
            self.advance();
            let infix = get_rule(self.parser.previous.kind)
                .infix
                .expect("token with infix precedence lacks an infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.matches(TokenKind::Eq) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.parser.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = &self.parser.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let id = self.heap.intern(contents);
        self.emit_constant(Value::object(id));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.parser.previous.kind {
            TokenKind::Null => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.parser.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    fn self_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'self' outside of a class.");
            return;
        }
        self.named_variable("self", false);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.parser.previous.kind;
        let precedence = get_rule(operator).precedence.next();
        self.parse_precedence(precedence);

        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::SlashSlash => self.emit_op(OpCode::FloorDivide),
            TokenKind::StarStar => self.emit_op(OpCode::Power),
            TokenKind::DotDot => self.emit_op(OpCode::DotDot),
            TokenKind::EqEq => self.emit_op(OpCode::Equal),
            TokenKind::BangEq => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Gt => self.emit_op(OpCode::Greater),
            TokenKind::GtEq => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Lt => self.emit_op(OpCode::Less),
            TokenKind::LtEq => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and_expr(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn is_expr(&mut self, _can_assign: bool) {
        let name = if self.matches(TokenKind::Identifier) {
            self.parser.previous.lexeme.clone()
        } else if self.matches(TokenKind::Null) {
            "null".to_string()
        } else {
            self.error_at_current("Expect type name after 'is'.");
            return;
        };

        let tag: u8 = match name.as_str() {
            "number" => 1,
            "bool" => 2,
            "null" => 3,
            "string" => 4,
            _ => 0,
        };
        let constant = self.identifier_constant(&name);
        self.emit_op(OpCode::Is);
        self.emit_byte(tag);
        self.emit_short(constant);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARGS {
                    self.error("Can't have more than 16 arguments.");
                }
                count = count.saturating_add(1);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(MAX_ARGS)
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::call(arg_count));
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.parser.previous.lexeme.clone();
        let constant = self.identifier_constant(&name);

        if can_assign && self.matches(TokenKind::Eq) {
            self.expression();
            self.emit_op(OpCode::SetField);
            self.emit_short(constant);
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_short(constant);
            self.emit_byte(arg_count);
        } else {
            self.emit_op(OpCode::GetField);
            self.emit_short(constant);
        }
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after subscript.");

        if can_assign && self.matches(TokenKind::Eq) {
            self.expression();
            self.emit_op(OpCode::SubscriptSet);
        } else {
            self.emit_op(OpCode::SubscriptGet);
        }
    }

    fn list(&mut self, _can_assign: bool) {
        self.emit_op(OpCode::CreateList);
        self.skip_newlines();
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                self.emit_op(OpCode::AppendList);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.skip_newlines();
        self.consume(TokenKind::RightBracket, "Expect ']' after list elements.");
    }

    // ---- statements ----

    fn declaration(&mut self) {
        if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else if self.matches(TokenKind::Function) {
            self.function_declaration();
        } else if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Enum) {
            self.enum_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::Do) {
            self.begin_scope();
            self.block_until(&[TokenKind::End]);
            self.consume(TokenKind::End, "Expect 'end' after block.");
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.emit_op(OpCode::Pop);
    }

    /// Statements until one of `stops` (or EOF) is next. Does not consume
    /// the stop token.
    fn block_until(&mut self, stops: &[TokenKind]) {
        self.skip_newlines();
        while !self.check(TokenKind::Eof) && !stops.iter().any(|k| self.check(*k)) {
            self.declaration();
            if self.parser.current.kind == TokenKind::Eof
                || stops.iter().any(|k| self.check(*k))
            {
                break;
            }
            self.terminate_statement();
            self.skip_newlines();
        }
        self.skip_newlines();
    }

    fn var_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect variable name.");
        let name = self.parser.previous.lexeme.clone();

        if self.current.scope_depth > 0 {
            self.declare_local(&name);
            if self.matches(TokenKind::Eq) {
                self.expression();
            } else {
                self.emit_op(OpCode::Nil);
            }
            self.mark_initialized();
        } else {
            let index = self.declare_global(&name);
            if self.matches(TokenKind::Eq) {
                self.expression();
            } else {
                self.emit_op(OpCode::Nil);
            }
            self.emit_op(OpCode::SetGlobal);
            self.emit_short(index);
            self.emit_op(OpCode::Pop);
        }
    }

    fn function_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect function name.");
        let name = self.parser.previous.lexeme.clone();

        if self.current.scope_depth > 0 {
            // Initialized before the body compiles so it can recurse.
            self.declare_local(&name);
            self.mark_initialized();
            self.function_body(FunctionKind::Function, &name);
        } else {
            let index = self.declare_global(&name);
            self.function_body(FunctionKind::Function, &name);
            self.emit_op(OpCode::SetGlobal);
            self.emit_short(index);
            self.emit_op(OpCode::Pop);
        }
    }

    /// Compile `(params) body end` into a function object and emit the
    /// CLOSURE instruction that captures its upvalues.
    fn function_body(&mut self, kind: FunctionKind, name: &str) {
        let name_id = self.heap.intern(name);
        let enclosing = std::mem::replace(
            &mut self.current,
            Box::new(FunctionCompiler::new(kind, Some(name_id))),
        );
        self.current.enclosing = Some(enclosing);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.current.function.arity == MAX_ARGS {
                    self.error_at_current("Can't have more than 16 parameters.");
                }
                self.current.function.arity = self.current.function.arity.saturating_add(1);
                self.consume(TokenKind::Identifier, "Expect parameter name.");
                let param = self.parser.previous.lexeme.clone();
                self.declare_local(&param);
                self.mark_initialized();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");

        self.block_until(&[TokenKind::End]);
        self.consume(TokenKind::End, "Expect 'end' after function body.");

        let function = self.finish_function();
        self.emit_closure(function);
    }

    fn emit_closure(&mut self, function: ObjId) {
        let constant = self.make_constant(Value::object(function));
        self.emit_op(OpCode::Closure);
        self.emit_short(constant);
        let pairs = std::mem::take(&mut self.pending_upvalues);
        for upvalue in pairs {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name = self.parser.previous.lexeme.clone();
        let name_constant = self.identifier_constant(&name);

        let local = self.current.scope_depth > 0;
        let global_index = if local {
            self.declare_local(&name);
            0
        } else {
            self.declare_global(&name)
        };

        self.emit_op(OpCode::Class);
        self.emit_short(name_constant);
        if local {
            self.mark_initialized();
        }

        if self.matches(TokenKind::Inherits) {
            self.consume(TokenKind::Identifier, "Expect parent class name.");
            let parent = self.parser.previous.lexeme.clone();
            if parent == name {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(&parent, false);
            self.emit_op(OpCode::Inherit);
        }

        self.classes.push(ClassContext {
            name: name.clone(),
            has_constructor: false,
        });

        self.skip_newlines();
        while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
            self.class_member();
            self.terminate_statement();
            self.skip_newlines();
        }
        self.consume(TokenKind::End, "Expect 'end' after class body.");
        self.classes.pop();

        // A local class stays on the stack as the local's slot; a global
        // one moves into its reserved index.
        if !local {
            self.emit_op(OpCode::SetGlobal);
            self.emit_short(global_index);
            self.emit_op(OpCode::Pop);
        }
    }

    fn class_member(&mut self) {
        let is_static = self.matches(TokenKind::Static);

        if self.matches(TokenKind::Var) {
            self.consume(TokenKind::Identifier, "Expect field name.");
            let name = self.parser.previous.lexeme.clone();
            let constant = self.identifier_constant(&name);
            if self.matches(TokenKind::Eq) {
                self.expression();
            } else {
                self.emit_op(OpCode::Nil);
            }
            self.emit_op(if is_static {
                OpCode::DefineStatic
            } else {
                OpCode::DefineField
            });
            self.emit_short(constant);
            return;
        }

        if self.matches(TokenKind::Function) {
            self.consume(TokenKind::Identifier, "Expect method name.");
            let name = self.parser.previous.lexeme.clone();
            let constant = self.identifier_constant(&name);

            let class_name = self
                .classes
                .last()
                .map(|c| c.name.clone())
                .unwrap_or_default();
            let is_constructor = name == class_name;

            if is_constructor {
                if is_static {
                    self.error("A constructor can't be static.");
                }
                let seen = self
                    .classes
                    .last()
                    .map(|c| c.has_constructor)
                    .unwrap_or(false);
                if seen {
                    self.error("A class can only have one constructor.");
                }
                if let Some(class) = self.classes.last_mut() {
                    class.has_constructor = true;
                }
                self.function_body(FunctionKind::Constructor, &name);
                self.emit_op(OpCode::DefineConstructor);
                self.emit_short(constant);
            } else {
                self.function_body(FunctionKind::Method, &name);
                self.emit_op(if is_static {
                    OpCode::DefineStatic
                } else {
                    OpCode::DefineMethod
                });
                self.emit_short(constant);
            }
            return;
        }

        self.error_at_current("Expect field, method or constructor in class body.");
    }

    fn enum_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect enum name.");
        let name = self.parser.previous.lexeme.clone();

        let local = self.current.scope_depth > 0;
        let global_index = if local {
            self.declare_local(&name);
            0
        } else {
            self.declare_global(&name)
        };

        // Enum members are fixed at compile time; the whole object is a
        // constant.
        let mut members = EnumObject::default();
        self.skip_newlines();
        while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
            self.consume(TokenKind::Identifier, "Expect enum member name.");
            let member = self.parser.previous.lexeme.clone();
            let member_id = self.heap.intern(&member);
            let hash = self.heap.str_hash(member_id);
            let value = Value::number(members.count as f64);
            if !members.members.insert(member_id, hash, value) {
                self.error("Duplicate enum member.");
            } else {
                members.count += 1;
            }

            if self.matches(TokenKind::Comma) {
                self.skip_newlines();
                continue;
            }
            if self.check(TokenKind::Line) {
                self.skip_newlines();
                continue;
            }
            break;
        }
        self.consume(TokenKind::End, "Expect 'end' after enum members.");

        let id = self.heap.alloc(ObjectKind::Enum(members));
        self.emit_constant(Value::object(id));

        if local {
            self.mark_initialized();
        } else {
            self.emit_op(OpCode::SetGlobal);
            self.emit_short(global_index);
            self.emit_op(OpCode::Pop);
        }
    }

    fn if_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Then, "Expect 'then' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.begin_scope();
        self.block_until(&[TokenKind::Else, TokenKind::End]);
        self.end_scope();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.begin_scope();
            self.block_until(&[TokenKind::End]);
            self.end_scope();
        }
        self.patch_jump(else_jump);
        self.consume(TokenKind::End, "Expect 'end' after if statement.");
    }

    fn while_statement(&mut self) {
        let loop_start = self.current.function.chunk.code.len();
        self.expression();
        self.consume(TokenKind::Do, "Expect 'do' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        let scope_depth = self.current.scope_depth;
        self.current.loops.push(LoopContext {
            start: loop_start,
            scope_depth,
            break_jumps: Vec::new(),
        });

        self.begin_scope();
        self.block_until(&[TokenKind::End]);
        self.end_scope();
        self.consume(TokenKind::End, "Expect 'end' after while body.");

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        let broken = self.current.loops.pop().expect("loop context underflow");
        for jump in broken.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn for_statement(&mut self) {
        self.consume(TokenKind::Identifier, "Expect loop variable name.");
        let variable = self.parser.previous.lexeme.clone();
        self.consume(TokenKind::In, "Expect 'in' after loop variable.");

        self.begin_scope();

        // hidden seq = <sequence expression>
        self.expression();
        self.add_local(HIDDEN_SEQ);
        self.mark_initialized();
        let seq_slot = (self.current.locals.len() - 1) as u16;

        // hidden iter = null
        self.emit_op(OpCode::Nil);
        self.add_local(HIDDEN_ITER);
        self.mark_initialized();
        let iter_slot = (self.current.locals.len() - 1) as u16;

        self.consume(TokenKind::Do, "Expect 'do' after loop expression.");

        let iterate = self.identifier_constant("iterate");
        let iterator_value = self.identifier_constant("iteratorValue");

        // loop: iter = seq.iterate(iter)
        let loop_start = self.current.function.chunk.code.len();
        self.emit_op(OpCode::GetLocal);
        self.emit_short(seq_slot);
        self.emit_op(OpCode::GetLocal);
        self.emit_short(iter_slot);
        self.emit_op(OpCode::Invoke);
        self.emit_short(iterate);
        self.emit_byte(1);
        self.emit_op(OpCode::SetLocal);
        self.emit_short(iter_slot);

        // if !iter then break
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        let scope_depth = self.current.scope_depth;
        self.current.loops.push(LoopContext {
            start: loop_start,
            scope_depth,
            break_jumps: Vec::new(),
        });

        // x = seq.iteratorValue(iter), fresh binding per iteration
        self.begin_scope();
        self.emit_op(OpCode::GetLocal);
        self.emit_short(seq_slot);
        self.emit_op(OpCode::GetLocal);
        self.emit_short(iter_slot);
        self.emit_op(OpCode::Invoke);
        self.emit_short(iterator_value);
        self.emit_byte(1);
        self.declare_local(&variable);
        self.mark_initialized();

        self.block_until(&[TokenKind::End]);
        self.end_scope();
        self.consume(TokenKind::End, "Expect 'end' after for body.");

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        let broken = self.current.loops.pop().expect("loop context underflow");
        for jump in broken.break_jumps {
            self.patch_jump(jump);
        }

        self.end_scope();
    }

    fn break_statement(&mut self) {
        if self.current.loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            return;
        }

        // Discard locals belonging to the loop body before leaving it.
        let loop_depth = self.current.loops.last().expect("loop context").scope_depth;
        let mut ops = Vec::new();
        for local in self.current.locals.iter().rev() {
            if local.depth <= loop_depth {
                break;
            }
            ops.push(if local.captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            });
        }
        for op in ops {
            self.emit_op(op);
        }

        let jump = self.emit_jump(OpCode::Jump);
        self.current
            .loops
            .last_mut()
            .expect("loop context")
            .break_jumps
            .push(jump);
    }

    fn return_statement(&mut self) {
        if self.current.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        let bare = matches!(
            self.parser.current.kind,
            TokenKind::Line
                | TokenKind::Semicolon
                | TokenKind::End
                | TokenKind::Else
                | TokenKind::Eof
        );

        if bare {
            self.emit_return();
            return;
        }

        if self.current.kind == FunctionKind::Constructor {
            self.error("Can't return a value from a constructor.");
        }
        self.expression();
        self.emit_op(OpCode::Return);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Module;
    use crate::table::Table;

    fn test_module(heap: &mut Heap) -> ObjId {
        heap.alloc(ObjectKind::Module(Module {
            name: "test".to_string(),
            source: String::new(),
            closure: None,
            global_map: Table::new(),
            globals: Vec::new(),
        }))
    }

    fn compile_source(source: &str) -> Option<String> {
        let mut heap = Heap::new();
        let module = test_module(&mut heap);
        compile(&mut heap, module, source)
            .map(|f| heap.function(f).chunk.disassemble(&heap, "test"))
    }

    #[test]
    fn compiles_arithmetic_expression() {
        let listing = compile_source("1 + 2 * 3\n").expect("should compile");
        assert!(listing.contains("OP_ADD"));
        assert!(listing.contains("OP_MULTIPLY"));
        // Factor binds tighter than term: multiply is emitted before add.
        assert!(listing.find("OP_MULTIPLY").unwrap() < listing.find("OP_ADD").unwrap());
    }

    #[test]
    fn comparisons_lower_to_negated_pairs() {
        let listing = compile_source("var a = 1 <= 2\n").expect("should compile");
        assert!(listing.contains("OP_GREATER"));
        assert!(listing.contains("OP_NOT"));
    }

    #[test]
    fn globals_persist_across_compiles() {
        let mut heap = Heap::new();
        let module = test_module(&mut heap);
        assert!(compile(&mut heap, module, "var x = 1\n").is_some());
        assert!(compile(&mut heap, module, "var y = x + 1\n").is_some());
        assert_eq!(heap.module(module).global_map.len(), 2);
    }

    #[test]
    fn undefined_variable_is_a_compile_error() {
        assert!(compile_source("var a = missing\n").is_none());
    }

    #[test]
    fn own_initializer_read_is_rejected() {
        assert!(compile_source("do\nvar a = 1\ndo\nvar a = a\nend\nend\n").is_none());
    }

    #[test]
    fn assignment_target_must_be_an_lvalue() {
        assert!(compile_source("var a = 1\n1 = a\n").is_none());
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        assert!(compile_source("break\n").is_none());
    }

    #[test]
    fn self_outside_class_is_rejected() {
        assert!(compile_source("var a = self\n").is_none());
    }

    #[test]
    fn duplicate_constructor_is_rejected() {
        let source = "\
class A
  function A() end
  function A() end
end
";
        assert!(compile_source(source).is_none());
    }

    #[test]
    fn constructor_cannot_return_a_value() {
        let source = "\
class A
  function A()
    return 1
  end
end
";
        assert!(compile_source(source).is_none());
    }

    #[test]
    fn static_constructor_is_rejected() {
        let source = "\
class A
  static function A() end
end
";
        assert!(compile_source(source).is_none());
    }

    #[test]
    fn self_inheritance_is_rejected() {
        assert!(compile_source("class A inherits A\nend\n").is_none());
    }

    #[test]
    fn semicolons_terminate_statements() {
        assert!(compile_source("var a = 1; var b = a + 1\n").is_some());
    }

    #[test]
    fn closures_emit_upvalue_pairs() {
        let source = "\
function outer()
  var n = 0
  function inner()
    n = n + 1
    return n
  end
  return inner
end
";
        let listing = compile_source(source).expect("should compile");
        assert!(listing.contains("OP_CLOSURE"));
    }

    #[test]
    fn for_loop_desugars_to_invokes() {
        let source = "var s = 0\nfor i in 1..3 do\ns = s + i\nend\n";
        let listing = compile_source(source).expect("should compile");
        assert!(listing.contains("OP_DOTDOT"));
        assert!(listing.contains("'iterate'"));
        assert!(listing.contains("'iteratorValue'"));
        assert!(listing.contains("OP_LOOP"));
    }

    #[test]
    fn enum_members_count_up_from_zero() {
        let mut heap = Heap::new();
        let module = test_module(&mut heap);
        let source = "enum Color\nRed\nGreen\nBlue\nend\n";
        assert!(compile(&mut heap, module, source).is_some());

        // The enum object lives in the constant pool of the script.
        let red = heap.intern("Red");
        let blue = heap.intern("Blue");
        let mut found = false;
        for id in heap.live_objects().collect::<Vec<_>>() {
            if let ObjectKind::Enum(e) = &heap.get(id).kind {
                assert_eq!(e.count, 3);
                let hash_red = heap.str_hash(red);
                let hash_blue = heap.str_hash(blue);
                assert_eq!(e.members.get(red, hash_red), Some(Value::number(0.0)));
                assert_eq!(e.members.get(blue, hash_blue), Some(Value::number(2.0)));
                found = true;
            }
        }
        assert!(found, "enum object should be allocated at compile time");
    }
}
