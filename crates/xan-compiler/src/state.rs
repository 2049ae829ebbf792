//! Per-function compile-time state: the register window, the active
//! locals, captured upvalue descriptors, and the loop contexts needed to
//! resolve `break`/`continue`.

use xan_core::{Chunk, FunctionType, Reg};

use crate::token::Token;

pub struct LocalVar<'src> {
    pub name: Token<'src>,
    pub depth: i32,
    pub captured: bool,
    pub reg: Reg,
}

pub struct UpvalDesc {
    pub index: u8,
    pub is_local: bool,
    pub name: String,
}

pub struct LoopCtx {
    pub break_jumps: Vec<usize>,
    pub continue_target: usize,
    pub scope_depth: i32,
}

pub struct FuncState<'src> {
    pub name: Option<String>,
    pub function_type: FunctionType,
    pub chunk: Chunk,
    pub locals: Vec<LocalVar<'src>>,
    pub upvalues: Vec<UpvalDesc>,
    pub scope_depth: i32,
    /// Next free temporary register; reset to `act_var` after every
    /// statement so expression temporaries never leak across statements.
    pub next_reg: Reg,
    /// Number of registers currently holding named locals (also the
    /// boundary below which a register must never be reused as a temp).
    pub act_var: Reg,
    /// High-water mark of `next_reg`; becomes `FunctionObj::stack_used`.
    pub max_reg: Reg,
    pub loops: Vec<LoopCtx>,
    /// One entry-point PC per supported argument count, most specific
    /// (fewest defaults applied) last; index `maxArity - argc`.
    pub code_offsets: Vec<usize>,
    pub arity_min: u8,
    pub arity_max: u8,
}

impl<'src> FuncState<'src> {
    pub fn new(function_type: FunctionType, name: Option<String>) -> Self {
        // Register 0 is always reserved: for methods/initializers it holds
        // `this`; for the top-level script and plain functions it is simply
        // unused by name but still consumes the slot so the calling
        // convention is uniform.
        let locals = vec![LocalVar {
            name: Token {
                ty: crate::token::TokenType::This,
                lexeme: if function_type == FunctionType::Function
                    || function_type == FunctionType::Script
                {
                    ""
                } else {
                    "this"
                },
                line: 0,
            },
            depth: 0,
            captured: false,
            reg: 0,
        }];
        FuncState {
            name,
            function_type,
            chunk: Chunk::new(),
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
            next_reg: 1,
            act_var: 1,
            max_reg: 1,
            loops: Vec::new(),
            code_offsets: Vec::new(),
            arity_min: 0,
            arity_max: 0,
        }
    }

    pub fn reserve_reg(&mut self) -> Reg {
        let r = self.next_reg;
        self.next_reg += 1;
        if self.next_reg > self.max_reg {
            self.max_reg = self.next_reg;
        }
        r
    }

    pub fn resolve_local(&self, name: &str) -> Option<Reg> {
        self.locals
            .iter()
            .rev()
            .find(|l| l.name.lexeme == name && l.depth >= 0)
            .map(|l| l.reg)
    }
}
