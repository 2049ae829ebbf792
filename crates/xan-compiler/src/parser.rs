//! The single-pass parser/emitter: a recursive-descent statement grammar on
//! top of a Pratt expression parser, producing bytecode directly (there is
//! no intermediate AST). Every expression-parsing function returns an
//! [`ExprDesc`]; the caller decides how (or whether) to discharge it into a
//! register.

use xan_core::{Chunk, FunctionType, Heap, Instr, OpCode, Reg, Value, NO_JUMP, UV_IS_LOCAL};

use crate::error::CompileError;
use crate::expr_desc::{ExprDesc, ExprKind};
use crate::scanner::Scanner;
use crate::state::{FuncState, LocalVar, LoopCtx, UpvalDesc};
use crate::token::{Token, TokenType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::None => Prec::Assignment,
            Prec::Assignment => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Equality,
            Prec::Equality => Prec::Comparison,
            Prec::Comparison => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Unary,
            Prec::Unary => Prec::Call,
            Prec::Call => Prec::Primary,
            Prec::Primary => Prec::Primary,
        }
    }
}

struct ClassCtx {
    has_superclass: bool,
}

pub struct Parser<'src, 'h> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    heap: &'h mut Heap,
    funcs: Vec<FuncState<'src>>,
    classes: Vec<ClassCtx>,
}

/// Compiles `source` into a top-level script function. On success returns
/// the function's heap reference (not yet wrapped in a closure — that is
/// the VM's job, mirroring how `interpret()` wraps the script function in
/// the original).
pub fn compile(source: &str, heap: &mut Heap) -> Result<xan_core::ObjRef, Vec<CompileError>> {
    let mut parser = Parser {
        scanner: Scanner::new(source),
        previous: Token {
            ty: TokenType::Eof,
            lexeme: "",
            line: 0,
        },
        current: Token {
            ty: TokenType::Eof,
            lexeme: "",
            line: 0,
        },
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        heap,
        funcs: vec![FuncState::new(FunctionType::Script, Some("script".to_string()))],
        classes: Vec::new(),
    };
    parser.advance();
    while !parser.check(TokenType::Eof) {
        parser.declaration();
    }
    parser.consume(TokenType::Eof, "Expect end of expression.");
    let func_ref = parser.finish_script();
    if parser.had_error {
        Err(parser.errors)
    } else {
        Ok(func_ref)
    }
}

impl<'src, 'h> Parser<'src, 'h> {
    // ---- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.ty != TokenType::Error {
                break;
            }
            let msg = self.current.lexeme.to_string();
            self.error_at_current(&msg);
        }
    }

    fn check(&self, ty: TokenType) -> bool {
        self.current.ty == ty
    }

    fn match_tok(&mut self, ty: TokenType) -> bool {
        if self.check(ty) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, ty: TokenType, msg: &str) {
        if self.current.ty == ty {
            self.advance();
        } else {
            self.error_at_current(msg);
        }
    }

    fn error_at_current(&mut self, msg: &str) {
        let tok = self.current;
        self.error_at(tok, msg);
    }

    fn error(&mut self, msg: &str) {
        let tok = self.previous;
        self.error_at(tok, msg);
    }

    fn error_at(&mut self, token: Token<'src>, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let lexeme = if token.ty == TokenType::Eof {
            String::new()
        } else {
            token.lexeme.to_string()
        };
        self.errors.push(CompileError {
            line: token.line,
            message: msg.to_string(),
            lexeme,
        });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.ty != TokenType::Eof {
            if self.previous.ty == TokenType::Semicolon {
                return;
            }
            match self.current.ty {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Return
                | TokenType::Try
                | TokenType::Throw => return,
                _ => self.advance(),
            }
        }
    }

    // ---- function/register state -------------------------------------

    fn current_func(&self) -> &FuncState<'src> {
        self.funcs.last().expect("no active function")
    }

    fn current_func_mut(&mut self) -> &mut FuncState<'src> {
        self.funcs.last_mut().expect("no active function")
    }

    fn current_pc(&self) -> usize {
        self.current_func().chunk.code.len()
    }

    fn is_temp(&self, r: Reg) -> bool {
        r >= self.current_func().act_var
    }

    fn free_above(&mut self, keep: Reg) {
        let f = self.current_func_mut();
        if f.next_reg > keep + 1 {
            f.next_reg = keep + 1;
        }
    }

    fn temp_or_reserve(&mut self, r: Reg) -> Reg {
        if self.is_temp(r) {
            r
        } else {
            self.current_func_mut().reserve_reg()
        }
    }

    // ---- emission ------------------------------------------------------

    fn emit_ad(&mut self, op: OpCode, a: Reg, d: u16, line: usize) -> usize {
        let instr = Instr::encode_ad(op, a, d);
        self.current_func_mut().chunk.write(instr, line)
    }

    fn emit_abc(&mut self, op: OpCode, a: Reg, b: Reg, c: Reg, line: usize) -> usize {
        let instr = Instr::encode_abc(op, a, b, c);
        self.current_func_mut().chunk.write(instr, line)
    }

    fn emit_a(&mut self, op: OpCode, a: Reg, line: usize) -> usize {
        self.emit_ad(op, a, 0, line)
    }

    fn emit_jump(&mut self, op: OpCode, a: Reg, line: usize) -> usize {
        self.emit_ad(op, a, NO_JUMP, line)
    }

    fn patch_jump(&mut self, pc: usize) {
        let here = self.current_pc();
        let offset = here as i32 - (pc as i32 + 1);
        let d = Instr::encode_jump_offset(offset);
        self.current_func_mut().chunk.code[pc].set_d(d);
    }

    fn emit_loop_back(&mut self, target: usize, line: usize) {
        let here = self.current_pc();
        let offset = target as i32 - (here as i32 + 1);
        let d = Instr::encode_jump_offset(offset);
        self.emit_ad(OpCode::Jump, 0, d, line);
    }

    fn add_number_const(&mut self, n: f64) -> u16 {
        self.current_func_mut().chunk.add_constant(Value::Number(n))
    }

    fn intern_bytes(&mut self, bytes: &[u8]) -> xan_core::ObjRef {
        self.heap.intern(bytes)
    }

    fn identifier_constant(&mut self, name: Token<'src>) -> u16 {
        let bytes = name.lexeme.as_bytes().to_vec();
        let r = self.intern_bytes(&bytes);
        self.current_func_mut().chunk.add_constant(Value::Obj(r))
    }

    fn string_literal_bytes(tok: Token<'src>) -> Vec<u8> {
        match tok.ty {
            TokenType::String => {
                let inner = &tok.lexeme[1..tok.lexeme.len() - 1];
                inner.as_bytes().to_vec()
            }
            _ => tok.lexeme.as_bytes().to_vec(),
        }
    }

    // ---- register discharge --------------------------------------------

    fn discharge_to_reg(&mut self, e: &mut ExprDesc, reg: Reg, line: usize) {
        match e.kind.clone() {
            ExprKind::Nil => {
                self.emit_ad(OpCode::Primitive, reg, 0, line);
            }
            ExprKind::True => {
                self.emit_ad(OpCode::Primitive, reg, 1, line);
            }
            ExprKind::False => {
                self.emit_ad(OpCode::Primitive, reg, 2, line);
            }
            ExprKind::Number(n) => {
                let idx = self.add_number_const(n);
                self.emit_ad(OpCode::LoadConst, reg, idx, line);
            }
            ExprKind::Const(idx) => {
                self.emit_ad(OpCode::LoadConst, reg, idx, line);
            }
            ExprKind::Local(r) => {
                if r != reg {
                    self.emit_abc(OpCode::Mov, reg, r, 0, line);
                }
            }
            ExprKind::Upval(u) => {
                self.emit_abc(OpCode::GetUpval, reg, u, 0, line);
            }
            ExprKind::Global(idx) => {
                self.emit_ad(OpCode::GetGlobal, reg, idx, line);
            }
            ExprKind::Super(s, n) => {
                self.emit_abc(OpCode::GetSuper, reg, s, n, line);
            }
            ExprKind::Reloc(pc) => {
                self.current_func_mut().chunk.code[pc].set_a(reg);
            }
            ExprKind::NonReloc(r) => {
                if r != reg {
                    self.emit_abc(OpCode::Mov, reg, r, 0, line);
                }
            }
            ExprKind::Void => {
                self.error("Expect expression.");
            }
        }
        e.kind = ExprKind::NonReloc(reg);
    }

    fn expr_to_any_reg(&mut self, e: &mut ExprDesc, line: usize) -> Reg {
        match e.kind {
            ExprKind::NonReloc(r) | ExprKind::Local(r) => r,
            _ => {
                let r = self.current_func_mut().reserve_reg();
                self.discharge_to_reg(e, r, line);
                r
            }
        }
    }

    /// Releases the temporary register `e` currently occupies, if any,
    /// before a caller reserves a fresh one. Without this, an already
    /// discharged compound expression (`binary`/`and_`/`or_`/`call`/`dot`/
    /// `subscript`, which all leave their result in a kept temporary) would
    /// have its register counted twice: once as its own result, once again
    /// for the new reservation landing on top of it — shifting every
    /// register allocated afterwards up by one.
    fn free_expr(&mut self, e: &ExprDesc) {
        if let ExprKind::NonReloc(r) = &e.kind {
            let r = *r;
            if self.is_temp(r) {
                self.free_above(r.saturating_sub(1));
            }
        }
    }

    fn expr_to_next_reg(&mut self, e: &mut ExprDesc, line: usize) -> Reg {
        self.free_expr(e);
        let r = self.current_func_mut().reserve_reg();
        self.discharge_to_reg(e, r, line);
        r
    }

    // ---- scopes ----------------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_func_mut().scope_depth += 1;
    }

    fn end_scope(&mut self, line: usize) {
        let new_depth = {
            let f = self.current_func_mut();
            f.scope_depth -= 1;
            f.scope_depth
        };
        let mut removed: Vec<LocalVar<'src>> = Vec::new();
        loop {
            let should_pop = matches!(self.current_func().locals.last(), Some(l) if l.depth > new_depth);
            if !should_pop {
                break;
            }
            removed.push(self.current_func_mut().locals.pop().unwrap());
        }
        if removed.iter().any(|l| l.captured) {
            let threshold = removed.iter().map(|l| l.reg).min().unwrap();
            self.emit_a(OpCode::CloseUpvalues, threshold, line);
        }
        let new_act_var = self
            .current_func()
            .locals
            .last()
            .map(|l| l.reg + 1)
            .unwrap_or(1);
        let f = self.current_func_mut();
        f.act_var = new_act_var;
        f.next_reg = new_act_var;
    }

    fn declare_local(&mut self, name: Token<'src>) {
        let depth = self.current_func().scope_depth;
        for local in self.current_func().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name.lexeme == name.lexeme {
                self.error("Already a variable with this name in this scope.");
                return;
            }
        }
    }

    fn resolve_upvalue(&mut self, func_index: usize, name: &str) -> Option<u8> {
        if func_index == 0 {
            return None;
        }
        let enclosing_index = func_index - 1;
        if let Some(local_reg) = self.funcs[enclosing_index].resolve_local(name) {
            for l in self.funcs[enclosing_index].locals.iter_mut() {
                if l.reg == local_reg && l.name.lexeme == name {
                    l.captured = true;
                }
            }
            return Some(self.add_upvalue(func_index, local_reg, true, name));
        }
        if let Some(up) = self.resolve_upvalue(enclosing_index, name) {
            return Some(self.add_upvalue(func_index, up, false, name));
        }
        None
    }

    fn add_upvalue(&mut self, func_index: usize, index: u8, is_local: bool, name: &str) -> u8 {
        let fs = &mut self.funcs[func_index];
        for (i, uv) in fs.upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return i as u8;
            }
        }
        fs.upvalues.push(UpvalDesc {
            index,
            is_local,
            name: name.to_string(),
        });
        (fs.upvalues.len() - 1) as u8
    }

    // ---- declarations ----------------------------------------------------

    fn declaration(&mut self) {
        if self.match_tok(TokenType::Class) {
            self.class_declaration();
        } else if self.match_tok(TokenType::Fun) {
            self.fun_declaration();
        } else if self.match_tok(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        // Every statement's temporaries are scratch space; the next
        // statement starts with a clean register window so the allocator
        // doesn't leak one slot per statement.
        let act_var = self.current_func().act_var;
        self.free_above(act_var.saturating_sub(1));
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn bind_name_to_value(&mut self, name: Token<'src>, value_reg: Reg) {
        if self.current_func().scope_depth > 0 {
            let depth = self.current_func().scope_depth;
            self.current_func_mut().locals.push(LocalVar {
                name,
                depth,
                captured: false,
                reg: value_reg,
            });
            self.current_func_mut().act_var = value_reg + 1;
        } else {
            let name_const = self.identifier_constant(name);
            self.emit_ad(OpCode::DefineGlobal, value_reg, name_const, name.line);
            self.free_above(value_reg.saturating_sub(1));
        }
    }

    fn var_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect variable name.");
        let name = self.previous;
        self.declare_local(name);
        let mut value = if self.match_tok(TokenType::Equal) {
            self.expression()
        } else {
            ExprDesc::new(ExprKind::Nil)
        };
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");
        let reg = self.expr_to_next_reg(&mut value, name.line);
        self.bind_name_to_value(name, reg);
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect function name.");
        let name = self.previous;
        self.declare_local(name);
        let dest = self.current_func_mut().reserve_reg();
        self.compile_function(FunctionType::Function, name.lexeme.to_string(), dest, name.line);
        self.bind_name_to_value(name, dest);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let name = self.previous;
        self.declare_local(name);
        let name_const = self.identifier_constant(name);
        let class_reg = self.current_func_mut().reserve_reg();
        self.emit_ad(OpCode::Class, class_reg, name_const, name.line);
        self.bind_name_to_value(name, class_reg);
        // re-resolve the class's own register/slot for use in the body below
        let class_value_reg = self
            .current_func()
            .resolve_local(name.lexeme)
            .unwrap_or(class_reg);

        self.classes.push(ClassCtx {
            has_superclass: false,
        });

        if self.match_tok(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            let super_name = self.previous;
            if super_name.lexeme == name.lexeme {
                self.error("A class can't inherit from itself.");
            }
            let mut super_expr = self.named_variable(super_name, false);
            self.begin_scope();
            let super_reg = self.current_func_mut().reserve_reg();
            self.discharge_to_reg(&mut super_expr, super_reg, super_name.line);
            let depth = self.current_func().scope_depth;
            self.current_func_mut().locals.push(LocalVar {
                name: Token::synthetic("super"),
                depth,
                captured: false,
                reg: super_reg,
            });
            self.current_func_mut().act_var = super_reg + 1;
            self.emit_abc(OpCode::Inherit, class_value_reg, super_reg, 0, super_name.line);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method(class_value_reg);
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");

        if self.classes.last().unwrap().has_superclass {
            self.end_scope(self.previous.line);
        }
        self.classes.pop();
    }

    fn method(&mut self, class_reg: Reg) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let name = self.previous;
        let name_const = self.identifier_constant(name);
        let ftype = if name.lexeme == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        let closure_reg = self.current_func_mut().reserve_reg();
        self.compile_function(ftype, name.lexeme.to_string(), closure_reg, name.line);
        let name_reg = self.current_func_mut().reserve_reg();
        self.emit_ad(OpCode::LoadConst, name_reg, name_const, name.line);
        self.emit_abc(OpCode::Method, class_reg, closure_reg, name_reg, name.line);
        self.free_above(closure_reg.saturating_sub(1));
    }

    /// Compiles a nested function body and emits `OP_CLOSURE` into `dest`
    /// in the *current* (enclosing) function.
    fn compile_function(&mut self, ftype: FunctionType, name: String, dest: Reg, line: usize) {
        self.funcs.push(FuncState::new(ftype, Some(name.clone())));

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        let mut arity_max: u8 = 0;
        let mut optional_count: u8 = 0;
        let mut block_starts: Vec<usize> = Vec::new();
        let mut seen_default = false;
        if !self.check(TokenType::RightParen) {
            loop {
                self.consume(TokenType::Identifier, "Expect parameter name.");
                let p_name = self.previous;
                self.declare_local(p_name);
                let reg = self.current_func_mut().reserve_reg();
                self.current_func_mut().locals.push(LocalVar {
                    name: p_name,
                    depth: 0,
                    captured: false,
                    reg,
                });
                self.current_func_mut().act_var = reg + 1;
                arity_max += 1;
                if self.match_tok(TokenType::Equal) {
                    seen_default = true;
                    optional_count += 1;
                    block_starts.push(self.current_pc());
                    let mut default_expr = self.expression();
                    self.discharge_to_reg(&mut default_expr, reg, p_name.line);
                } else if seen_default {
                    self.error("Required parameter cannot follow an optional parameter.");
                }
                if !self.match_tok(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        let arity_min = arity_max - optional_count;

        let body_start = self.current_pc();
        let mut code_offsets = vec![0usize; optional_count as usize + 1];
        code_offsets[0] = body_start;
        for k in 1..=optional_count as usize {
            code_offsets[k] = block_starts[optional_count as usize - k];
        }

        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.begin_scope();
        self.block_body();
        let end_line = self.previous.line;
        self.end_scope(end_line);

        if ftype == FunctionType::Initializer {
            self.emit_a(OpCode::Return, 0, end_line);
        } else {
            let r = self.current_func_mut().reserve_reg();
            self.emit_ad(OpCode::Primitive, r, 0, end_line);
            self.emit_a(OpCode::Return, r, end_line);
        }

        self.current_func_mut().code_offsets = code_offsets;
        self.current_func_mut().arity_min = arity_min;
        self.current_func_mut().arity_max = arity_max;

        let fs = self.funcs.pop().unwrap();
        let upvalue_descriptors: Vec<u16> = fs
            .upvalues
            .iter()
            .map(|u| (u.index as u16) | if u.is_local { UV_IS_LOCAL } else { 0 })
            .collect();
        let fname_ref = self.heap.intern(name.as_bytes());
        let func_obj = xan_core::FunctionObj {
            arity_min: fs.arity_min,
            arity_max: fs.arity_max,
            code_offsets: fs.code_offsets.iter().map(|&p| p as u32).collect(),
            upvalue_descriptors,
            stack_used: fs.max_reg,
            chunk: fs.chunk,
            name: Some(fname_ref),
        };
        let func_ref = self.heap.allocate(xan_core::ObjData::Function(func_obj));
        let const_idx = self.current_func_mut().chunk.add_constant(Value::Obj(func_ref));
        self.emit_ad(OpCode::Closure, dest, const_idx, line);
    }

    /// Closes out the top-level script function: emits the implicit
    /// `return nil` every chunk needs to unwind cleanly, then packages the
    /// root `FuncState` into a `FunctionObj` the same way `compile_function`
    /// does for nested functions (minus the enclosing `OP_CLOSURE`, since
    /// the script itself has no enclosing frame to emit into).
    fn finish_script(&mut self) -> xan_core::ObjRef {
        let end_line = self.previous.line;
        let r = self.current_func_mut().reserve_reg();
        self.emit_ad(OpCode::Primitive, r, 0, end_line);
        self.emit_a(OpCode::Return, r, end_line);

        let fs = self.funcs.pop().expect("script FuncState must be present");
        let upvalue_descriptors: Vec<u16> = fs
            .upvalues
            .iter()
            .map(|u| (u.index as u16) | if u.is_local { UV_IS_LOCAL } else { 0 })
            .collect();
        let name = fs.name.as_ref().map(|n| self.heap.intern(n.as_bytes()));
        let func_obj = xan_core::FunctionObj {
            arity_min: 0,
            arity_max: 0,
            code_offsets: vec![0],
            upvalue_descriptors,
            stack_used: fs.max_reg,
            chunk: fs.chunk,
            name,
        };
        self.heap.allocate(xan_core::ObjData::Function(func_obj))
    }

    /// Like `block()` but does not consume scope braces itself — caller
    /// owns the begin/end-scope pair so parameters and body share one
    /// scope.
    fn block_body(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    // ---- statements --------------------------------------------------

    fn statement(&mut self) {
        if self.match_tok(TokenType::If) {
            self.if_statement();
        } else if self.match_tok(TokenType::While) {
            self.while_statement();
        } else if self.match_tok(TokenType::For) {
            self.for_statement();
        } else if self.match_tok(TokenType::Return) {
            self.return_statement();
        } else if self.match_tok(TokenType::Try) {
            self.try_statement();
        } else if self.match_tok(TokenType::Throw) {
            self.throw_statement();
        } else if self.match_tok(TokenType::Break) {
            self.break_statement();
        } else if self.match_tok(TokenType::Continue) {
            self.continue_statement();
        } else if self.match_tok(TokenType::LeftBrace) {
            let line = self.previous.line;
            self.begin_scope();
            self.block_body();
            self.end_scope(line);
        } else {
            self.expression_statement();
        }
    }

    fn expression_statement(&mut self) {
        let _ = self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        let mut cond = self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");
        let line = self.previous.line;
        let cond_reg = self.expr_to_any_reg(&mut cond, line);
        let else_jump = self.emit_jump(OpCode::JumpIfFalse, cond_reg, line);
        self.statement();
        if self.match_tok(TokenType::Else) {
            let end_jump = self.emit_jump(OpCode::Jump, 0, line);
            self.patch_jump(else_jump);
            self.statement();
            self.patch_jump(end_jump);
        } else {
            self.patch_jump(else_jump);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_pc();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        let mut cond = self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");
        let line = self.previous.line;
        let cond_reg = self.expr_to_any_reg(&mut cond, line);
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse, cond_reg, line);
        let depth = self.current_func().scope_depth;
        self.current_func_mut().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_target: loop_start,
            scope_depth: depth,
        });
        self.statement();
        self.emit_loop_back(loop_start, line);
        let lc = self.current_func_mut().loops.pop().unwrap();
        self.patch_jump(exit_jump);
        for bj in lc.break_jumps {
            self.patch_jump(bj);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.match_tok(TokenType::Semicolon) {
            // no initializer
        } else if self.match_tok(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let cond_start = self.current_pc();
        let mut exit_jump = None;
        if !self.match_tok(TokenType::Semicolon) {
            let mut cond = self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            let line = self.previous.line;
            let cond_reg = self.expr_to_any_reg(&mut cond, line);
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse, cond_reg, line));
        }

        let mut continue_target = cond_start;
        if !self.check(TokenType::RightParen) {
            let line = self.previous.line;
            let body_jump = self.emit_jump(OpCode::Jump, 0, line);
            let post_start = self.current_pc();
            let _ = self.expression();
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");
            self.emit_loop_back(cond_start, line);
            self.patch_jump(body_jump);
            continue_target = post_start;
        } else {
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");
        }

        let depth = self.current_func().scope_depth;
        self.current_func_mut().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_target,
            scope_depth: depth,
        });
        self.statement();
        let line = self.previous.line;
        self.emit_loop_back(continue_target, line);
        let lc = self.current_func_mut().loops.pop().unwrap();
        if let Some(ej) = exit_jump {
            self.patch_jump(ej);
        }
        for bj in lc.break_jumps {
            self.patch_jump(bj);
        }
        self.end_scope(line);
    }

    fn break_statement(&mut self) {
        let line = self.previous.line;
        self.consume(TokenType::Semicolon, "Expect ';' after 'break'.");
        if self.current_func().loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            return;
        }
        let jump_pc = self.emit_jump(OpCode::Jump, 0, line);
        self.current_func_mut()
            .loops
            .last_mut()
            .unwrap()
            .break_jumps
            .push(jump_pc);
    }

    fn continue_statement(&mut self) {
        let line = self.previous.line;
        self.consume(TokenType::Semicolon, "Expect ';' after 'continue'.");
        if self.current_func().loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        }
        let target = self.current_func().loops.last().unwrap().continue_target;
        self.emit_loop_back(target, line);
    }

    fn return_statement(&mut self) {
        let line = self.previous.line;
        if self.current_func().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_tok(TokenType::Semicolon) {
            if self.current_func().function_type == FunctionType::Initializer {
                self.emit_a(OpCode::Return, 0, line);
            } else {
                let r = self.current_func_mut().reserve_reg();
                self.emit_ad(OpCode::Primitive, r, 0, line);
                self.emit_a(OpCode::Return, r, line);
            }
            return;
        }
        if self.current_func().function_type == FunctionType::Initializer {
            self.error("Can't return a value from an initializer.");
        }
        let mut val = self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after return value.");
        let r = self.expr_to_any_reg(&mut val, line);
        self.emit_a(OpCode::Return, r, line);
    }

    fn throw_statement(&mut self) {
        let mut val = self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after thrown value.");
        let line = self.previous.line;
        let r = self.expr_to_any_reg(&mut val, line);
        self.emit_a(OpCode::Throw, r, line);
    }

    /// Compiles `try { … } catch (Type ident) { … } … catch { … }`. Any
    /// number of typed `catch` clauses may chain, each tested in source
    /// order; a trailing untyped `catch { … }` matches whatever reaches it
    /// and binds no variable. If no clause matches (and there is no
    /// untyped catch-all), the exception is rethrown.
    fn try_statement(&mut self) {
        let line = self.previous.line;
        let exc_slot = self.current_func_mut().reserve_reg();
        // Pin exc_slot as a synthetic local at the enclosing depth, same
        // trick as the `super` local in `super_()`. Without this, the try
        // body's own begin_scope/end_scope (and each catch clause's) would
        // reset next_reg/act_var from `locals` alone, forgetting exc_slot
        // was reserved and letting a later temporary reuse its register
        // before the catch clauses read the caught value out of it.
        let outer_depth = self.current_func().scope_depth;
        self.current_func_mut().locals.push(LocalVar {
            name: Token::synthetic("try exception"),
            depth: outer_depth,
            captured: false,
            reg: exc_slot,
        });
        self.current_func_mut().act_var = exc_slot + 1;
        let begin_pc = self.emit_ad(OpCode::BeginTry, exc_slot, 0, line);

        self.consume(TokenType::LeftBrace, "Expect '{' after 'try'.");
        self.begin_scope();
        self.block_body();
        self.end_scope(self.previous.line);
        self.emit_a(OpCode::EndTry, 0, self.previous.line);
        let skip_catch = self.emit_jump(OpCode::Jump, 0, self.previous.line);

        let handler_pc = self.current_pc();
        self.current_func_mut().chunk.code[begin_pc].set_d(handler_pc as u16);

        self.consume(TokenType::Catch, "Expect 'catch' after 'try' block.");

        let mut end_jumps: Vec<usize> = Vec::new();
        let mut saw_catch_all = false;
        loop {
            if saw_catch_all {
                self.error("A 'catch' clause cannot follow an untyped 'catch'.");
            }
            if self.match_tok(TokenType::LeftParen) {
                self.consume(TokenType::Identifier, "Expect exception type name.");
                let type_name = self.previous;
                self.consume(TokenType::Identifier, "Expect exception variable name.");
                let var_name = self.previous;
                self.consume(TokenType::RightParen, "Expect ')' after catch clause.");

                let type_const = self.identifier_constant(type_name);
                let type_reg = self.current_func_mut().reserve_reg();
                self.emit_ad(OpCode::LoadConst, type_reg, type_const, type_name.line);
                let not_match_jump =
                    self.emit_ad(OpCode::JumpIfNotExc, type_reg, NO_JUMP, type_name.line);
                self.current_func_mut().chunk.code[not_match_jump] =
                    Instr::encode_abc(OpCode::JumpIfNotExc, type_reg, exc_slot, 0);
                // JumpIfNotExc's displacement rides the immediately following
                // Jump, same trick as `CopyJumpIf*`: skip it when the type
                // matches, fall through to it (testing the next clause, or
                // re-throwing if this was the last one) when it doesn't.
                let next_clause_jump = self.emit_jump(OpCode::Jump, 0, type_name.line);
                self.free_above(type_reg.saturating_sub(1));

                self.consume(TokenType::LeftBrace, "Expect '{' after catch clause.");
                self.begin_scope();
                let depth = self.current_func().scope_depth;
                self.current_func_mut().locals.push(LocalVar {
                    name: var_name,
                    depth,
                    captured: false,
                    reg: exc_slot,
                });
                self.current_func_mut().act_var = exc_slot + 1;
                self.current_func_mut().next_reg = exc_slot + 1;
                self.block_body();
                self.end_scope(self.previous.line);
                end_jumps.push(self.emit_jump(OpCode::Jump, 0, self.previous.line));

                self.patch_jump(next_clause_jump);
            } else {
                saw_catch_all = true;
                self.consume(TokenType::LeftBrace, "Expect '{' after catch clause.");
                self.begin_scope();
                self.block_body();
                self.end_scope(self.previous.line);
                end_jumps.push(self.emit_jump(OpCode::Jump, 0, self.previous.line));
            }

            if !self.match_tok(TokenType::Catch) {
                break;
            }
        }

        if !saw_catch_all {
            self.emit_a(OpCode::Throw, exc_slot, self.previous.line);
        }

        self.patch_jump(skip_catch);
        for j in end_jumps {
            self.patch_jump(j);
        }

        // Retire the synthetic local ourselves since it was never matched by
        // a begin_scope(); recompute act_var/next_reg the way end_scope()
        // would, from whatever local is now last.
        self.current_func_mut().locals.pop();
        let new_act_var = self
            .current_func()
            .locals
            .last()
            .map(|l| l.reg + 1)
            .unwrap_or(1);
        self.current_func_mut().act_var = new_act_var;
        self.current_func_mut().next_reg = new_act_var;
    }

    // ---- expressions ---------------------------------------------------

    fn expression(&mut self) -> ExprDesc {
        self.parse_precedence(Prec::Assignment)
    }

    fn parse_precedence(&mut self, prec: Prec) -> ExprDesc {
        self.advance();
        let can_assign = prec <= Prec::Assignment;
        let mut left = self.prefix(self.previous.ty, can_assign);
        while prec <= Self::infix_precedence(self.current.ty) {
            self.advance();
            left = self.infix(self.previous.ty, left, can_assign);
        }
        if can_assign && self.match_tok(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
        left
    }

    fn infix_precedence(ty: TokenType) -> Prec {
        use TokenType::*;
        match ty {
            Or => Prec::Or,
            And => Prec::And,
            EqualEqual | BangEqual => Prec::Equality,
            Less | LessEqual | Greater | GreaterEqual => Prec::Comparison,
            Plus | Minus => Prec::Term,
            Star | Slash | Percent => Prec::Factor,
            LeftParen | Dot | LeftBracket => Prec::Call,
            _ => Prec::None,
        }
    }

    fn prefix(&mut self, ty: TokenType, can_assign: bool) -> ExprDesc {
        use TokenType::*;
        match ty {
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(),
            Number => self.number(),
            String => self.string_lit(),
            True => ExprDesc::new(ExprKind::True),
            False => ExprDesc::new(ExprKind::False),
            Nil => ExprDesc::new(ExprKind::Nil),
            Identifier => {
                let tok = self.previous;
                self.named_variable(tok, can_assign)
            }
            This => self.this_(),
            Super => self.super_(),
            LeftBracket => self.array_literal(),
            LeftBrace => self.table_literal(),
            _ => {
                self.error("Expect expression.");
                ExprDesc::new(ExprKind::Void)
            }
        }
    }

    fn infix(&mut self, ty: TokenType, left: ExprDesc, can_assign: bool) -> ExprDesc {
        use TokenType::*;
        match ty {
            Plus | Minus | Star | Slash | Percent | EqualEqual | BangEqual | Less | LessEqual
            | Greater | GreaterEqual => self.binary(ty, left),
            And => self.and_(left),
            Or => self.or_(left),
            LeftParen => self.call(left),
            Dot => self.dot(left, can_assign),
            LeftBracket => self.subscript(left, can_assign),
            _ => left,
        }
    }

    fn grouping(&mut self) -> ExprDesc {
        let e = self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
        e
    }

    fn number(&mut self) -> ExprDesc {
        let n: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        ExprDesc::new(ExprKind::Number(n))
    }

    fn string_lit(&mut self) -> ExprDesc {
        let tok = self.previous;
        let bytes = Self::string_literal_bytes(tok);
        let r = self.intern_bytes(&bytes);
        let idx = self.current_func_mut().chunk.add_constant(Value::Obj(r));
        ExprDesc::new(ExprKind::Const(idx))
    }

    fn unary(&mut self) -> ExprDesc {
        let op = self.previous.ty;
        let line = self.previous.line;
        let mut operand = self.parse_precedence(Prec::Unary);
        let r = self.expr_to_any_reg(&mut operand, line);
        let dest = self.temp_or_reserve(r);
        match op {
            TokenType::Minus => self.emit_abc(OpCode::Negate, dest, r, 0, line),
            TokenType::Bang => self.emit_abc(OpCode::Not, dest, r, 0, line),
            _ => unreachable!(),
        };
        self.free_above(dest);
        ExprDesc::new(ExprKind::NonReloc(dest))
    }

    fn binary(&mut self, op: TokenType, mut left: ExprDesc) -> ExprDesc {
        let line = self.previous.line;
        let prec = Self::infix_precedence(op);
        let lreg = self.expr_to_any_reg(&mut left, line);
        let mut right = self.parse_precedence(prec.next());
        let rreg = self.expr_to_any_reg(&mut right, line);
        let dest = self.temp_or_reserve(lreg);
        let opcode = match op {
            TokenType::Plus => OpCode::Add,
            TokenType::Minus => OpCode::Sub,
            TokenType::Star => OpCode::Mul,
            TokenType::Slash => OpCode::Div,
            TokenType::Percent => OpCode::Mod,
            TokenType::EqualEqual => OpCode::Equal,
            TokenType::BangEqual => OpCode::NotEqual,
            TokenType::Less => OpCode::Less,
            TokenType::LessEqual => OpCode::LessEqual,
            TokenType::Greater => OpCode::Greater,
            TokenType::GreaterEqual => OpCode::GreaterEqual,
            _ => unreachable!(),
        };
        self.emit_abc(opcode, dest, lreg, rreg, line);
        self.free_above(dest);
        ExprDesc::new(ExprKind::NonReloc(dest))
    }

    fn and_(&mut self, mut left: ExprDesc) -> ExprDesc {
        let line = self.previous.line;
        let lreg = self.expr_to_any_reg(&mut left, line);
        let dest = self.temp_or_reserve(lreg);
        if dest != lreg {
            self.emit_abc(OpCode::Mov, dest, lreg, 0, line);
        }
        self.emit_abc(OpCode::CopyJumpIfFalse, dest, dest, 0, line);
        let companion_jump = self.emit_jump(OpCode::Jump, 0, line);
        self.free_above(dest);
        let mut right = self.parse_precedence(Prec::And.next());
        self.discharge_to_reg(&mut right, dest, line);
        self.patch_jump(companion_jump);
        ExprDesc::new(ExprKind::NonReloc(dest))
    }

    fn or_(&mut self, mut left: ExprDesc) -> ExprDesc {
        let line = self.previous.line;
        let lreg = self.expr_to_any_reg(&mut left, line);
        let dest = self.temp_or_reserve(lreg);
        if dest != lreg {
            self.emit_abc(OpCode::Mov, dest, lreg, 0, line);
        }
        self.emit_abc(OpCode::CopyJumpIfTrue, dest, dest, 0, line);
        let companion_jump = self.emit_jump(OpCode::Jump, 0, line);
        self.free_above(dest);
        let mut right = self.parse_precedence(Prec::Or.next());
        self.discharge_to_reg(&mut right, dest, line);
        self.patch_jump(companion_jump);
        ExprDesc::new(ExprKind::NonReloc(dest))
    }

    fn call(&mut self, mut callee: ExprDesc) -> ExprDesc {
        let line = self.previous.line;
        let base = self.expr_to_next_reg(&mut callee, line);
        let mut argc: u32 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                let mut arg = self.expression();
                self.expr_to_next_reg(&mut arg, line);
                argc += 1;
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                if !self.match_tok(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        self.emit_abc(OpCode::Call, base, 1, argc as u8, line);
        self.free_above(base);
        ExprDesc::new(ExprKind::NonReloc(base))
    }

    fn dot(&mut self, mut left: ExprDesc, can_assign: bool) -> ExprDesc {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.previous;
        let line = name.line;
        let name_const = self.identifier_constant(name);
        let obj_reg = self.expr_to_any_reg(&mut left, line);
        if can_assign && self.match_tok(TokenType::Equal) {
            let mut val = self.expression();
            let val_reg = self.expr_to_any_reg(&mut val, line);
            let name_reg = self.current_func_mut().reserve_reg();
            self.emit_ad(OpCode::LoadConst, name_reg, name_const, line);
            self.emit_abc(OpCode::SetProperty, val_reg, obj_reg, name_reg, line);
            self.free_above(val_reg);
            return ExprDesc::new(ExprKind::NonReloc(val_reg));
        }
        let name_reg = self.current_func_mut().reserve_reg();
        self.emit_ad(OpCode::LoadConst, name_reg, name_const, line);
        let dest = self.current_func_mut().reserve_reg();
        self.emit_abc(OpCode::GetProperty, dest, obj_reg, name_reg, line);
        self.free_above(dest);
        ExprDesc::new(ExprKind::NonReloc(dest))
    }

    fn subscript(&mut self, mut left: ExprDesc, can_assign: bool) -> ExprDesc {
        let obj_reg = {
            let line = self.previous.line;
            self.expr_to_any_reg(&mut left, line)
        };
        let mut key = self.expression();
        self.consume(TokenType::RightBracket, "Expect ']' after index.");
        let line = self.previous.line;
        let key_reg = self.expr_to_any_reg(&mut key, line);
        if can_assign && self.match_tok(TokenType::Equal) {
            let mut val = self.expression();
            let val_reg = self.expr_to_any_reg(&mut val, line);
            self.emit_abc(OpCode::SetSubscript, val_reg, obj_reg, key_reg, line);
            self.free_above(val_reg);
            return ExprDesc::new(ExprKind::NonReloc(val_reg));
        }
        let dest = self.current_func_mut().reserve_reg();
        self.emit_abc(OpCode::GetSubscript, dest, obj_reg, key_reg, line);
        self.free_above(dest);
        ExprDesc::new(ExprKind::NonReloc(dest))
    }

    fn array_literal(&mut self) -> ExprDesc {
        let line = self.previous.line;
        let base = self.current_func_mut().reserve_reg();
        let mut count: u32 = 0;
        if !self.check(TokenType::RightBracket) {
            loop {
                if self.check(TokenType::RightBracket) {
                    break;
                }
                let mut el = self.expression();
                self.expr_to_next_reg(&mut el, line);
                count += 1;
                if !self.match_tok(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightBracket, "Expect ']' after array elements.");
        self.emit_abc(OpCode::NewArray, base, count as u8, 0, line);
        self.free_above(base);
        ExprDesc::new(ExprKind::NonReloc(base))
    }

    fn table_literal(&mut self) -> ExprDesc {
        let line = self.previous.line;
        let base = self.current_func_mut().reserve_reg();
        let mut count: u32 = 0;
        if !self.check(TokenType::RightBrace) {
            loop {
                if self.check(TokenType::RightBrace) {
                    break;
                }
                if !self.match_tok(TokenType::String) && !self.match_tok(TokenType::Identifier) {
                    self.error_at_current("Expect table key (string or identifier).");
                    break;
                }
                let key_tok = self.previous;
                let bytes = Self::string_literal_bytes(key_tok);
                let key_ref = self.intern_bytes(&bytes);
                let key_const = self.current_func_mut().chunk.add_constant(Value::Obj(key_ref));
                let key_reg = self.current_func_mut().reserve_reg();
                self.emit_ad(OpCode::LoadConst, key_reg, key_const, line);
                self.consume(TokenType::Colon, "Expect ':' after table key.");
                let mut val = self.expression();
                self.expr_to_next_reg(&mut val, line);
                count += 1;
                if !self.match_tok(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightBrace, "Expect '}' after table literal.");
        self.emit_abc(OpCode::NewTable, base, count as u8, 0, line);
        self.free_above(base);
        ExprDesc::new(ExprKind::NonReloc(base))
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) -> ExprDesc {
        let line = name.line;
        if let Some(reg) = self.current_func().resolve_local(name.lexeme) {
            if can_assign && self.match_tok(TokenType::Equal) {
                let mut val = self.expression();
                self.discharge_to_reg(&mut val, reg, line);
                return ExprDesc::new(ExprKind::NonReloc(reg));
            }
            return ExprDesc::new(ExprKind::Local(reg));
        }
        let func_index = self.funcs.len() - 1;
        if let Some(up) = self.resolve_upvalue(func_index, name.lexeme) {
            if can_assign && self.match_tok(TokenType::Equal) {
                let mut val = self.expression();
                let r = self.expr_to_any_reg(&mut val, line);
                self.emit_abc(OpCode::SetUpval, up, r, 0, line);
                return ExprDesc::new(ExprKind::NonReloc(r));
            }
            return ExprDesc::new(ExprKind::Upval(up));
        }
        let name_const = self.identifier_constant(name);
        if can_assign && self.match_tok(TokenType::Equal) {
            let mut val = self.expression();
            let r = self.expr_to_any_reg(&mut val, line);
            self.emit_ad(OpCode::SetGlobal, r, name_const, line);
            return ExprDesc::new(ExprKind::NonReloc(r));
        }
        ExprDesc::new(ExprKind::Global(name_const))
    }

    fn this_(&mut self) -> ExprDesc {
        let func_index = self.funcs.len() - 1;
        if let Some(reg) = self.current_func().resolve_local("this") {
            return ExprDesc::new(ExprKind::Local(reg));
        }
        if let Some(up) = self.resolve_upvalue(func_index, "this") {
            return ExprDesc::new(ExprKind::Upval(up));
        }
        self.error("Can't use 'this' outside of a class.");
        ExprDesc::new(ExprKind::Void)
    }

    fn super_(&mut self) -> ExprDesc {
        let line = self.previous.line;
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name = self.previous;
        let name_const = self.identifier_constant(name);
        let name_reg = self.current_func_mut().reserve_reg();
        self.emit_ad(OpCode::LoadConst, name_reg, name_const, line);

        let func_index = self.funcs.len() - 1;
        let super_reg = if let Some(reg) = self.current_func().resolve_local("super") {
            reg
        } else if let Some(up) = self.resolve_upvalue(func_index, "super") {
            let r = self.current_func_mut().reserve_reg();
            self.emit_abc(OpCode::GetUpval, r, up, 0, line);
            r
        } else {
            0
        };
        ExprDesc::new(ExprKind::Super(super_reg, name_reg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xan_core::ObjData;

    fn compile_ok(src: &str) -> (xan_core::ObjRef, Heap) {
        let mut heap = Heap::new();
        let func_ref = compile(src, &mut heap).unwrap_or_else(|errs| panic!("compile failed: {errs:?}"));
        (func_ref, heap)
    }

    fn function_of<'h>(heap: &'h Heap, r: xan_core::ObjRef) -> &'h xan_core::FunctionObj {
        match heap.data(r) {
            ObjData::Function(f) => f,
            _ => panic!("expected a function object"),
        }
    }

    #[test]
    fn undeclared_identifier_becomes_a_global_load() {
        let (func_ref, heap) = compile_ok("print(x);");
        let f = function_of(&heap, func_ref);
        assert!(f.chunk.code.iter().any(|i| i.op() == OpCode::GetGlobal));
    }

    #[test]
    fn local_variable_does_not_emit_a_global_load() {
        let (func_ref, heap) = compile_ok("var x = 1; print(x);");
        let f = function_of(&heap, func_ref);
        assert!(!f.chunk.code.iter().any(|i| i.op() == OpCode::GetGlobal));
    }

    /// Testable property 6: an `and`/`or` chain of N operands emits exactly
    /// N-1 conditional jumps.
    #[test]
    fn and_or_chain_emits_one_conditional_jump_per_extra_operand() {
        let (func_ref, heap) = compile_ok("var a = 1 and 2 and 3 and 4;");
        let f = function_of(&heap, func_ref);
        let conditional_jumps = f
            .chunk
            .code
            .iter()
            .filter(|i| matches!(i.op(), OpCode::CopyJumpIfFalse | OpCode::CopyJumpIfTrue))
            .count();
        assert_eq!(conditional_jumps, 3);
    }

    /// Testable property 2: the compiled function's `stackUsed` is the
    /// high-water mark of the register allocator, not merely the count of
    /// declared locals.
    #[test]
    fn stack_used_reflects_register_high_water_mark_not_just_locals() {
        let (func_ref, heap) = compile_ok("var a = 1; var b = (2 + 3) * (4 + 5);");
        let f = function_of(&heap, func_ref);
        // Two locals occupy registers 1-2 (register 0 is reserved); the
        // nested arithmetic needs at least one more temporary beyond that.
        assert!(f.stack_used > 2);
    }

    #[test]
    fn temporaries_are_released_after_each_statement() {
        let (func_ref, heap) = compile_ok("print(1 + 2); print(3 + 4);");
        let f = function_of(&heap, func_ref);
        // Both statements are independent expression statements with no
        // locals in scope, so each should reuse the same temporary
        // registers rather than the high-water mark growing unboundedly.
        assert!(f.stack_used <= 4);
    }

    #[test]
    fn closure_over_enclosing_local_records_an_is_local_upvalue() {
        let (func_ref, heap) = compile_ok("fun outer() { var x = 1; fun inner() { return x; } return inner; }");
        let outer = function_of(&heap, func_ref);
        // The outer function's only constant besides its body is the
        // nested `inner` closure.
        let inner_ref = outer
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(r) if matches!(heap.data(*r), ObjData::Function(_)) => Some(*r),
                _ => None,
            })
            .expect("inner function constant");
        let inner = function_of(&heap, inner_ref);
        assert_eq!(inner.upvalue_descriptors.len(), 1);
        assert_eq!(inner.upvalue_descriptors[0] & xan_core::UV_IS_LOCAL, xan_core::UV_IS_LOCAL);
    }

    #[test]
    fn default_parameters_get_one_entry_point_per_arity() {
        let (func_ref, heap) = compile_ok("fun f(a, b=1, c=2) { return a; } var g = f;");
        let outer = function_of(&heap, func_ref);
        let inner_ref = outer
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(r) if matches!(heap.data(*r), ObjData::Function(_)) => Some(*r),
                _ => None,
            })
            .expect("f's function constant");
        let f = function_of(&heap, inner_ref);
        assert_eq!(f.arity_min, 1);
        assert_eq!(f.arity_max, 3);
        assert_eq!(f.code_offsets.len(), 3);
        // Entry points must be strictly increasing: fewer supplied
        // arguments means more default-filling prologue to run through.
        assert!(f.code_offsets[2] < f.code_offsets[1]);
        assert!(f.code_offsets[1] < f.code_offsets[0]);
    }

    #[test]
    fn panic_mode_collects_more_than_one_diagnostic() {
        let mut heap = Heap::new();
        let errs = compile("var = 1;\nvar y = 2 +;\n", &mut heap).unwrap_err();
        assert!(errs.len() >= 2, "expected independent diagnostics per malformed line, got {errs:?}");
    }

    #[test]
    fn method_without_superclass_rejects_super() {
        let mut heap = Heap::new();
        let errs = compile("class A { greet() { super.greet(); } }", &mut heap).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("super")));
    }

    #[test]
    fn class_cannot_inherit_from_itself() {
        let mut heap = Heap::new();
        let errs = compile("class A < A {}", &mut heap).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("inherit from itself")));
    }
}
