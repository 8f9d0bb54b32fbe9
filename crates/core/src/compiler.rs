//! Single-pass compiler: tokens in, bytecode out.
//!
//! A Pratt expression parser drives code generation directly; there is no
//! AST. Each function under compilation gets its own [`FnCompiler`] with
//! its locals, upvalue metadata, and loop contexts; nested function
//! declarations push and pop compilers.
//!
//! The compiler allocates heap objects (interned names, functions, struct
//! types) with the collector paused, so nothing here needs rooting.

use std::rc::Rc;

use crate::chunk::{Chunk, OpCode};
use crate::error::CompileError;
use crate::heap::GcStatus;
use crate::object::{Function, Object, StructType};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::{ObjRef, Value};
use crate::vm::Vm;

/// Compile a source text into a top-level function object. Diagnostics are
/// printed to stderr as they are found; the returned error only counts
/// them.
pub fn compile(vm: &mut Vm, source: &str, path: &str) -> Result<ObjRef, CompileError> {
    let previous_status = vm.heap.status;
    vm.heap.status = GcStatus::Paused;

    let mut parser = Parser::new(vm, source, path);
    parser.advance();
    while !parser.matches(TokenKind::Eof) {
        parser.declaration();
    }
    let function = parser.finish_script();
    let errors = parser.errors;

    vm.heap.status = previous_status;
    if errors > 0 {
        Err(CompileError { count: errors })
    } else {
        Ok(function)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Shift,
    Term,
    Factor,
    Power,
    Unary,
    Call,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Shift,
            Precedence::Shift => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Power,
            Precedence::Power => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Call,
        }
    }
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::Or => Precedence::Or,
        TokenKind::And => Precedence::And,
        TokenKind::EqualEqual | TokenKind::BangEqual => Precedence::Equality,
        TokenKind::Less
        | TokenKind::LessEqual
        | TokenKind::Greater
        | TokenKind::GreaterEqual => Precedence::Comparison,
        TokenKind::LeftShift | TokenKind::RightShift => Precedence::Shift,
        TokenKind::Plus | TokenKind::Minus => Precedence::Term,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Precedence::Factor,
        TokenKind::StarStar => Precedence::Power,
        TokenKind::LeftParen | TokenKind::Dot | TokenKind::LeftBracket => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while the initializer is still being compiled.
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueMeta {
    index: u8,
    is_local: bool,
}

#[derive(Debug)]
struct LoopCtx {
    start: usize,
    scope_depth: i32,
    breaks: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

struct FnCompiler<'src> {
    kind: FunctionKind,
    name: &'src str,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueMeta>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
}

impl<'src> FnCompiler<'src> {
    fn new(kind: FunctionKind, name: &'src str) -> Self {
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            // Slot zero holds the closure itself.
            locals: vec![Local {
                name: "",
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

struct Parser<'src, 'vm> {
    vm: &'vm mut Vm,
    scanner: Scanner<'src>,
    path: &'src str,
    current: Token<'src>,
    previous: Token<'src>,
    errors: usize,
    panic_mode: bool,
    compilers: Vec<FnCompiler<'src>>,
}

impl<'src, 'vm> Parser<'src, 'vm> {
    fn new(vm: &'vm mut Vm, source: &'src str, path: &'src str) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 0,
        };
        Self {
            vm,
            scanner: Scanner::new(source),
            path,
            current: placeholder,
            previous: placeholder,
            errors: 0,
            panic_mode: false,
            compilers: vec![FnCompiler::new(FunctionKind::Script, "")],
        }
    }

    // ----- token plumbing -----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors += 1;
        match token.kind {
            TokenKind::Eof => {
                eprintln!("[{}:{}] Error at end: {}", self.path, token.line, message);
            }
            TokenKind::Error => {
                eprintln!("[{}:{}] Error: {}", self.path, token.line, message);
            }
            _ => {
                eprintln!(
                    "[{}:{}] Error at '{}': {}",
                    self.path, token.line, token.lexeme, message
                );
            }
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Fn
                | TokenKind::Let
                | TokenKind::Struct
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Match
                | TokenKind::Use
                | TokenKind::Pub => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ----- emit helpers -----

    fn compiler(&mut self) -> &mut FnCompiler<'src> {
        self.compilers.last_mut().expect("compiler stack is empty")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.compiler().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.compiler().chunk.add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_byte(index);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.vm.copy_string(name);
        self.make_constant(Value::Object(interned))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.compiler().chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.compiler().chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.compiler().chunk.code[offset] = (jump >> 8) as u8;
        self.compiler().chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.compiler().chunk.code.len() - start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body is too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn code_len(&mut self) -> usize {
        self.compiler().chunk.code.len()
    }

    fn emit_return(&mut self) {
        self.emit_ops(OpCode::Nil, OpCode::Return);
    }

    // ----- scopes and locals -----

    fn begin_scope(&mut self) {
        self.compiler().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compiler().scope_depth -= 1;
        loop {
            let (emit_close, done) = {
                let fc = self.compilers.last().expect("compiler stack is empty");
                match fc.locals.last() {
                    Some(local) if local.depth > fc.scope_depth => (local.is_captured, false),
                    _ => (false, true),
                }
            };
            if done {
                return;
            }
            if emit_close {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.compiler().locals.pop();
        }
    }

    fn declare_local(&mut self, name: &'src str) {
        let duplicate = {
            let fc = self.compilers.last().expect("compiler stack is empty");
            fc.locals
                .iter()
                .rev()
                .take_while(|l| l.depth == -1 || l.depth >= fc.scope_depth)
                .any(|l| l.name == name)
        };
        if duplicate {
            self.error("A variable with this name already exists in this scope.");
        }
        if self.compiler().locals.len() > u8::MAX as usize {
            self.error("Too many local variables in one function.");
            return;
        }
        self.compiler().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let fc = self.compiler();
        if fc.scope_depth == 0 {
            return;
        }
        let depth = fc.scope_depth;
        if let Some(local) = fc.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8, public: bool) {
        if self.compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_byte(global);
        self.emit_byte(u8::from(public));
    }

    fn resolve_local(&mut self, ci: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let found = {
            let fc = &self.compilers[ci];
            fc.locals
                .iter()
                .enumerate()
                .rev()
                .find(|(_, l)| l.name == name)
                .map(|(i, l)| {
                    if l.depth == -1 {
                        uninitialized = true;
                    }
                    i as u8
                })
        };
        if uninitialized {
            self.error("Cannot read a local variable in its own initializer.");
        }
        found
    }

    fn resolve_upvalue(&mut self, ci: usize, name: &str) -> Option<u8> {
        if ci == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(ci - 1, name) {
            self.compilers[ci - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(ci, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(ci - 1, name) {
            return Some(self.add_upvalue(ci, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, ci: usize, index: u8, is_local: bool) -> u8 {
        let meta = UpvalueMeta { index, is_local };
        if let Some(existing) = self.compilers[ci].upvalues.iter().position(|u| *u == meta) {
            return existing as u8;
        }
        if self.compilers[ci].upvalues.len() > u8::MAX as usize {
            self.error("Too many captured variables in one function.");
            return 0;
        }
        self.compilers[ci].upvalues.push(meta);
        (self.compilers[ci].upvalues.len() - 1) as u8
    }

    // ----- declarations -----

    fn declaration(&mut self) {
        if self.matches(TokenKind::Pub) {
            let allowed =
                self.compilers.len() == 1 && self.compilers[0].scope_depth == 0;
            if !allowed {
                self.error("Public declarations are only allowed at module top level.");
            }
            if self.matches(TokenKind::Fn) {
                self.fn_declaration(allowed);
            } else if self.matches(TokenKind::Let) {
                self.let_declaration(allowed);
            } else if self.matches(TokenKind::Struct) {
                self.struct_declaration(allowed);
            } else {
                self.error_at_current("Expected a declaration after 'pub'.");
            }
        } else if self.matches(TokenKind::Fn) {
            self.fn_declaration(false);
        } else if self.matches(TokenKind::Let) {
            self.let_declaration(false);
        } else if self.matches(TokenKind::Struct) {
            self.struct_declaration(false);
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn let_declaration(&mut self, public: bool) {
        self.consume(TokenKind::Identifier, "Expected a variable name.");
        let name = self.previous.lexeme;
        let global = if self.compiler().scope_depth > 0 {
            self.declare_local(name);
            0
        } else {
            self.identifier_constant(name)
        };
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expected ';' after a variable declaration.",
        );
        self.define_variable(global, public);
    }

    fn fn_declaration(&mut self, public: bool) {
        self.consume(TokenKind::Identifier, "Expected a function name.");
        let name = self.previous.lexeme;
        let global = if self.compiler().scope_depth > 0 {
            self.declare_local(name);
            self.mark_initialized(); // functions may recurse
            0
        } else {
            self.identifier_constant(name)
        };
        self.function_body(name);
        self.define_variable(global, public);
    }

    fn function_body(&mut self, name: &'src str) {
        self.compilers
            .push(FnCompiler::new(FunctionKind::Function, name));
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after the function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.compiler().arity == u8::MAX {
                    self.error_at_current("A function cannot have more than 255 parameters.");
                }
                self.compiler().arity = self.compiler().arity.wrapping_add(1);
                self.consume(TokenKind::Identifier, "Expected a parameter name.");
                let param = self.previous.lexeme;
                self.declare_local(param);
                self.mark_initialized();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after the parameters.");
        self.consume(TokenKind::LeftBrace, "Expected '{' before the function body.");
        self.block();
        self.emit_return();

        let fc = self.compilers.pop().expect("compiler stack is empty");
        let name_ref = self.vm.copy_string(fc.name);
        let function = self.vm.alloc(Object::Function(Function {
            name: Some(name_ref),
            arity: fc.arity,
            upvalue_count: fc.upvalues.len(),
            chunk: Rc::new(fc.chunk),
        }));
        let index = self.make_constant(Value::Object(function));
        self.emit_op(OpCode::Closure);
        self.emit_byte(index);
        for upvalue in &fc.upvalues {
            let (is_local, index) = (u8::from(upvalue.is_local), upvalue.index);
            let line = self.previous.line;
            self.compiler().chunk.write(is_local, line);
            self.compiler().chunk.write(index, line);
        }
    }

    fn struct_declaration(&mut self, public: bool) {
        self.consume(TokenKind::Identifier, "Expected a struct name.");
        let name = self.previous.lexeme;
        let global = if self.compiler().scope_depth > 0 {
            self.declare_local(name);
            0
        } else {
            self.identifier_constant(name)
        };
        self.consume(TokenKind::LeftBrace, "Expected '{' after the struct name.");
        let mut fields: Vec<&str> = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.consume(TokenKind::Identifier, "Expected a field name.");
            fields.push(self.previous.lexeme);
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after the struct fields.");
        self.matches(TokenKind::Semicolon);

        let name_ref = self.vm.copy_string(name);
        let field_refs: Vec<ObjRef> = fields.iter().map(|f| self.vm.copy_string(f)).collect();
        let struct_ref = self.vm.alloc(Object::Struct(StructType {
            name: name_ref,
            fields: field_refs,
        }));
        self.emit_constant(Value::Object(struct_ref));
        self.define_variable(global, public);
    }

    // ----- statements -----

    fn statement(&mut self) {
        if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::Match) {
            self.match_statement();
        } else if self.matches(TokenKind::Use) {
            self.use_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after the block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after an expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after the condition.");
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.code_len();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after the condition.");
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        let depth = self.compiler().scope_depth;
        self.compiler().loops.push(LoopCtx {
            start: loop_start,
            scope_depth: depth,
            breaks: Vec::new(),
        });
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        let breaks = self
            .compiler()
            .loops
            .pop()
            .map(|l| l.breaks)
            .unwrap_or_default();
        for offset in breaks {
            self.patch_jump(offset);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Let) {
            self.let_declaration(false);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.code_len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after the loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.code_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expected ')' after the for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let depth = self.compiler().scope_depth;
        self.compiler().loops.push(LoopCtx {
            start: loop_start,
            scope_depth: depth,
            breaks: Vec::new(),
        });
        self.statement();
        self.emit_loop(loop_start);
        if let Some(offset) = exit_jump {
            self.patch_jump(offset);
        }
        let breaks = self
            .compiler()
            .loops
            .pop()
            .map(|l| l.breaks)
            .unwrap_or_default();
        for offset in breaks {
            self.patch_jump(offset);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.compiler().kind == FunctionKind::Script {
            self.error("Cannot return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after the return value.");
            self.emit_op(OpCode::Return);
        }
    }

    /// Emit pops (or upvalue closes) for locals deeper than `depth`,
    /// without forgetting them; used by break/continue, which jump out of
    /// scopes the compiler is still inside.
    fn discard_locals(&mut self, depth: i32) {
        let closes: Vec<bool> = {
            let fc = self.compilers.last().expect("compiler stack is empty");
            fc.locals
                .iter()
                .rev()
                .take_while(|l| l.depth > depth)
                .map(|l| l.is_captured)
                .collect()
        };
        for is_captured in closes {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expected ';' after 'break'.");
        let Some(depth) = self.compiler().loops.last().map(|l| l.scope_depth) else {
            self.error("A 'break' statement is only allowed inside a loop.");
            return;
        };
        self.discard_locals(depth);
        let offset = self.emit_jump(OpCode::Jump);
        if let Some(ctx) = self.compiler().loops.last_mut() {
            ctx.breaks.push(offset);
        }
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expected ';' after 'continue'.");
        let Some((depth, start)) = self
            .compiler()
            .loops
            .last()
            .map(|l| (l.scope_depth, l.start))
        else {
            self.error("A 'continue' statement is only allowed inside a loop.");
            return;
        };
        self.discard_locals(depth);
        self.emit_loop(start);
    }

    fn match_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::LeftBrace, "Expected '{' after the match value.");
        self.emit_op(OpCode::SetMatchTarget);

        let mut end_jumps = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::Default) {
                self.consume(TokenKind::EqualArrow, "Expected '=>' after 'default'.");
                self.statement();
                end_jumps.push(self.emit_jump(OpCode::Jump));
            } else if self.matches(TokenKind::ResultOk) {
                self.result_arm(OpCode::MatchOk, &mut end_jumps);
            } else if self.matches(TokenKind::ResultErr) {
                self.result_arm(OpCode::MatchErr, &mut end_jumps);
            } else {
                // Literal pattern: any non-assignment expression.
                self.parse_precedence(Precedence::Or);
                self.consume(TokenKind::EqualArrow, "Expected '=>' after a match pattern.");
                self.emit_op(OpCode::MatchEqual);
                let miss = self.emit_jump(OpCode::JumpIfFalse);
                self.statement();
                end_jumps.push(self.emit_jump(OpCode::Jump));
                self.patch_jump(miss);
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after the match arms.");
        for offset in end_jumps {
            self.patch_jump(offset);
        }
        self.emit_op(OpCode::ClearMatch);
    }

    /// One `Ok(x)` / `Err(e)` arm: test, bind the payload as a scoped
    /// local, run the body.
    fn result_arm(&mut self, test: OpCode, end_jumps: &mut Vec<usize>) {
        self.consume(TokenKind::LeftParen, "Expected '(' after the pattern name.");
        self.consume(TokenKind::Identifier, "Expected a binding name.");
        let bind_name = self.previous.lexeme;
        self.consume(TokenKind::RightParen, "Expected ')' after the binding name.");
        self.consume(TokenKind::EqualArrow, "Expected '=>' after a match pattern.");
        self.emit_op(test);
        let miss = self.emit_jump(OpCode::JumpIfFalse);
        self.begin_scope();
        self.emit_op(OpCode::GetMatchBind);
        self.declare_local(bind_name);
        self.mark_initialized();
        self.statement();
        self.end_scope();
        end_jumps.push(self.emit_jump(OpCode::Jump));
        self.patch_jump(miss);
    }

    fn use_statement(&mut self) {
        if self.matches(TokenKind::LeftBrace) {
            let mut names: Vec<&str> = Vec::new();
            loop {
                self.consume(TokenKind::Identifier, "Expected an imported name.");
                names.push(self.previous.lexeme);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::RightBrace, "Expected '}' after the import list.");
            self.consume(TokenKind::From, "Expected 'from' after the import list.");
            self.consume(TokenKind::String, "Expected a module path string.");
            let path = self.string_constant();
            self.consume(TokenKind::Semicolon, "Expected ';' after the import.");
            if names.len() > u8::MAX as usize {
                self.error("Too many names in one import.");
                return;
            }
            self.emit_op(OpCode::ImportFrom);
            self.emit_byte(path);
            self.emit_byte(names.len() as u8);
            for name in names {
                let index = self.identifier_constant(name);
                self.emit_byte(index);
            }
        } else {
            self.consume(TokenKind::String, "Expected a module path string after 'use'.");
            let path = self.string_constant();
            self.consume(TokenKind::As, "Expected 'as' after the module path.");
            self.consume(TokenKind::Identifier, "Expected a module alias.");
            let alias = self.identifier_constant(self.previous.lexeme);
            self.consume(TokenKind::Semicolon, "Expected ';' after the import.");
            self.emit_op(OpCode::ImportAs);
            self.emit_byte(path);
            self.emit_byte(alias);
        }
    }

    // ----- expressions -----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        match self.previous.kind {
            TokenKind::Int => self.int_literal(),
            TokenKind::Float => self.float_literal(),
            TokenKind::String => self.string_literal(),
            TokenKind::Identifier => {
                let name = self.previous.lexeme;
                self.named_variable(name, can_assign);
            }
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang | TokenKind::Not => self.unary(),
            TokenKind::TypeOf => self.typeof_expression(),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::LeftBracket => self.array_literal(),
            TokenKind::LeftBrace => self.table_literal(),
            TokenKind::New => self.struct_literal(),
            _ => {
                self.error("Expected an expression.");
                return;
            }
        }

        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            match self.previous.kind {
                TokenKind::And => self.and_expression(),
                TokenKind::Or => self.or_expression(),
                TokenKind::LeftParen => self.call_arguments(),
                TokenKind::Dot => self.dot(can_assign),
                TokenKind::LeftBracket => self.subscript(can_assign),
                _ => self.binary(),
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn int_literal(&mut self) {
        match self.previous.lexeme.parse::<i32>() {
            Ok(value) => {
                if (-128..=127).contains(&value) {
                    self.emit_op(OpCode::PushInt);
                    self.emit_byte(value as i8 as u8);
                } else {
                    self.emit_constant(Value::Int(value));
                }
            }
            Err(_) => self.error("Integer literal is too large."),
        }
    }

    fn float_literal(&mut self) {
        match self.previous.lexeme.parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Float(value)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    /// Strip the quotes and resolve `\` escapes: a backslash makes the
    /// next character literal.
    fn unescape(lexeme: &str) -> String {
        let inner = &lexeme[1..lexeme.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Intern the just-consumed string token and add it to the pool.
    fn string_constant(&mut self) -> u8 {
        let text = Self::unescape(self.previous.lexeme);
        let interned = self.vm.take_string(text);
        self.make_constant(Value::Object(interned))
    }

    fn string_literal(&mut self) {
        let index = self.string_constant();
        self.emit_op(OpCode::Constant);
        self.emit_byte(index);
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let top = self.compilers.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(top, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let index = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, index)
        };

        let compound = [
            (TokenKind::PlusEqual, OpCode::Add),
            (TokenKind::MinusEqual, OpCode::Subtract),
            (TokenKind::StarEqual, OpCode::Multiply),
            (TokenKind::SlashEqual, OpCode::Divide),
            (TokenKind::PercentEqual, OpCode::Modulus),
        ];
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(set_op);
            self.emit_byte(arg);
            return;
        }
        if can_assign {
            for (token, op) in compound {
                if self.matches(token) {
                    self.emit_op(get_op);
                    self.emit_byte(arg);
                    self.expression();
                    self.emit_op(op);
                    self.emit_op(set_op);
                    self.emit_byte(arg);
                    return;
                }
            }
        }
        self.emit_op(get_op);
        self.emit_byte(arg);
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after the expression.");
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang | TokenKind::Not => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn typeof_expression(&mut self) {
        self.parse_precedence(Precedence::Unary);
        self.emit_op(OpCode::TypeOf);
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        let precedence = infix_precedence(operator);
        // `**` is right-associative; everything else binds left.
        if operator == TokenKind::StarStar {
            self.parse_precedence(precedence);
        } else {
            self.parse_precedence(precedence.next());
        }
        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulus),
            TokenKind::StarStar => self.emit_op(OpCode::Power),
            TokenKind::LeftShift => self.emit_op(OpCode::ShiftLeft),
            TokenKind::RightShift => self.emit_op(OpCode::ShiftRight),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn and_expression(&mut self) {
        let short_circuit = self.emit_jump(OpCode::JumpIfFalsePeek);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(short_circuit);
    }

    fn or_expression(&mut self) {
        let rhs = self.emit_jump(OpCode::JumpIfFalsePeek);
        let end = self.emit_jump(OpCode::Jump);
        self.patch_jump(rhs);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                count += 1;
                if count > u8::MAX as u16 {
                    self.error("A call cannot have more than 255 arguments.");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after the arguments.");
        count as u8
    }

    fn call_arguments(&mut self) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expected a property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name);
            self.emit_byte(argc);
        } else if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(name);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(name);
        }
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expected ']' after the subscript.");
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetIndex);
        } else {
            self.emit_op(OpCode::GetIndex);
        }
    }

    fn array_literal(&mut self) {
        let mut count: u16 = 0;
        while !self.check(TokenKind::RightBracket) && !self.check(TokenKind::Eof) {
            self.expression();
            count += 1;
            if count > u8::MAX as u16 {
                self.error("An array literal cannot have more than 255 elements.");
            }
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBracket, "Expected ']' after the array elements.");
        self.emit_op(OpCode::NewArray);
        self.emit_byte(count as u8);
    }

    fn table_literal(&mut self) {
        let mut count: u16 = 0;
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.expression();
            self.consume(TokenKind::Colon, "Expected ':' between a table key and value.");
            self.expression();
            count += 1;
            if count > u8::MAX as u16 {
                self.error("A table literal cannot have more than 255 entries.");
            }
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after the table entries.");
        self.emit_op(OpCode::NewTable);
        self.emit_byte(count as u8);
    }

    fn struct_literal(&mut self) {
        self.consume(TokenKind::Identifier, "Expected a struct name after 'new'.");
        let name = self.previous.lexeme;
        self.named_variable(name, false);
        self.consume(TokenKind::LeftBrace, "Expected '{' after the struct name.");
        let mut field_indices = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.consume(TokenKind::Identifier, "Expected a field name.");
            let index = self.identifier_constant(self.previous.lexeme);
            self.consume(TokenKind::Colon, "Expected ':' after the field name.");
            self.expression();
            field_indices.push(index);
            if field_indices.len() > u8::MAX as usize {
                self.error("A struct literal cannot have more than 255 fields.");
            }
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after the struct fields.");
        self.emit_op(OpCode::NewStruct);
        self.emit_byte(field_indices.len() as u8);
        for index in field_indices {
            self.emit_byte(index);
        }
    }

    // ----- finish -----

    fn finish_script(&mut self) -> ObjRef {
        self.emit_return();
        let fc = self.compilers.pop().expect("compiler stack is empty");
        self.vm.alloc(Object::Function(Function {
            name: None,
            arity: 0,
            upvalue_count: 0,
            chunk: Rc::new(fc.chunk),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> bool {
        let mut vm = Vm::new(vec![]);
        compile(&mut vm, source, "<test>").is_ok()
    }

    #[test]
    fn test_compiles_basic_program() {
        assert!(compile_ok("let x = 1 + 2 * 3; x = x - 1;"));
    }

    #[test]
    fn test_compiles_functions_and_closures() {
        assert!(compile_ok(
            "fn make() { let x = 10; fn inc() { x = x + 1; return x; } return inc; }"
        ));
    }

    #[test]
    fn test_compiles_control_flow() {
        assert!(compile_ok(
            "let i = 0; while (i < 10) { if (i == 5) { break; } i += 1; } \
             for (let j = 0; j < 3; j = j + 1) { continue; }"
        ));
    }

    #[test]
    fn test_compiles_collections_and_match() {
        assert!(compile_ok(
            "let a = [1, 2, 3]; let t = {'k': 1}; t['x'] = a[0]; \
             match t['k'] { 1 => t['k'] = 2; default => t['k'] = 0; }"
        ));
    }

    #[test]
    fn test_rejects_missing_semicolon() {
        assert!(!compile_ok("let x = 1"));
    }

    #[test]
    fn test_rejects_top_level_return() {
        assert!(!compile_ok("return 1;"));
    }

    #[test]
    fn test_rejects_break_outside_loop() {
        assert!(!compile_ok("break;"));
    }

    #[test]
    fn test_rejects_self_referential_initializer() {
        assert!(!compile_ok("{ let a = 1; { let a = a; } }"));
    }

    #[test]
    fn test_rejects_invalid_assignment_target() {
        assert!(!compile_ok("1 + 2 = 3;"));
    }

    #[test]
    fn test_unescape() {
        assert_eq!(Parser::unescape("'a\\'b'"), "a'b");
        assert_eq!(Parser::unescape("\"x\\\\y\""), "x\\y");
        assert_eq!(Parser::unescape("\"plain\""), "plain");
    }
}
