use std::mem;

use once_cell::sync::Lazy;

use crate::{
    chunk::{Chunk, OpCode},
    objects::{object::Object, object_function::ObjectFunction, object_manager::ObjectManager},
    scanner::{Scanner, Token, TokenType},
    table::Table,
    value::{make_number_value, make_object_value, make_string_value, Value},
};

/// Single-pass compiler driver. Owns the scanner, the token window, and a
/// stack of `Compiler` records (one per function being compiled) plus a
/// stack of `ClassCompiler` records (one per enclosing class declaration).
pub struct Parser<'a> {
    current: Token<'a>,
    previous: Token<'a>,
    scanner: Option<Box<Scanner<'a>>>,
    has_error: bool,
    panic_mode: bool,
    compilers: Vec<Compiler<'a>>,
    class_compilers: Vec<ClassCompiler>,
    object_manager: &'a mut ObjectManager,
    intern_strings: &'a mut Table,
}

struct Local<'a> {
    name: Token<'a>,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum FunctionType {
    Function,
    Initializer,
    Method,
    Script,
}

struct Compiler<'a> {
    function: Box<ObjectFunction>,
    function_type: FunctionType,
    locals: Vec<Local<'a>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

impl<'a> Compiler<'a> {
    fn new(function_type: FunctionType) -> Self {
        Compiler {
            function: Box::new(ObjectFunction::new(0, String::new())),
            function_type,
            locals: vec![],
            upvalues: vec![],
            scope_depth: 0,
        }
    }
}

struct ClassCompiler {
    has_superclass: bool,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl From<u8> for Precedence {
    fn from(value: u8) -> Self {
        match value {
            0 => Precedence::None,
            1 => Precedence::Assignment,
            2 => Precedence::Or,
            3 => Precedence::And,
            4 => Precedence::Equality,
            5 => Precedence::Comparison,
            6 => Precedence::Term,
            7 => Precedence::Factor,
            8 => Precedence::Unary,
            9 => Precedence::Call,
            10 => Precedence::Primary,
            _ => unreachable!("Invalid precedence value: {}", value),
        }
    }
}

type ParserFn = fn(&mut Parser<'_>, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(prefix: Option<ParserFn>, infix: Option<ParserFn>, precedence: Precedence) -> Self {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

static RULES: Lazy<[ParseRule; TokenType::Eof as usize + 1]> = Lazy::new(|| {
    let mut rules = [ParseRule::new(None, None, Precedence::None); TokenType::Eof as usize + 1];

    rules[TokenType::LeftParen as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.grouping()),
        Some(|parser, can_assign| parser.call(can_assign)),
        Precedence::Call,
    );

    rules[TokenType::Dot as usize] = ParseRule::new(
        None,
        Some(|parser, can_assign| parser.dot(can_assign)),
        Precedence::Call,
    );

    rules[TokenType::Minus as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.unary()),
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Term,
    );

    rules[TokenType::Plus as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Term,
    );

    rules[TokenType::Slash as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Factor,
    );

    rules[TokenType::Star as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Factor,
    );

    rules[TokenType::Bang as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.unary()), None, Precedence::None);

    rules[TokenType::BangEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Equality,
    );

    rules[TokenType::EqualEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Equality,
    );

    rules[TokenType::Greater as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::GreaterEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::Less as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::LessEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::Identifier as usize] = ParseRule::new(
        Some(|parser, can_assign| parser.variable(can_assign)),
        None,
        Precedence::None,
    );

    rules[TokenType::String as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.string()), None, Precedence::None);

    rules[TokenType::Number as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.number()), None, Precedence::None);

    rules[TokenType::And as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.and()),
        Precedence::And,
    );

    rules[TokenType::Or as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.or()),
        Precedence::Or,
    );

    rules[TokenType::False as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.literal()), None, Precedence::None);

    rules[TokenType::True as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.literal()), None, Precedence::None);

    rules[TokenType::Nil as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.literal()), None, Precedence::None);

    rules[TokenType::Super as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.super_()), None, Precedence::None);

    rules[TokenType::This as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.this()), None, Precedence::None);

    rules
});

fn synthetic_token(text: &'static str) -> Token<'static> {
    Token {
        token_type: TokenType::Identifier,
        value: text,
        line: 0,
    }
}

impl<'a> Parser<'a> {
    pub fn new(object_manager: &'a mut ObjectManager, intern_strings: &'a mut Table) -> Box<Parser<'a>> {
        let mut parser = Box::new(Parser {
            current: Token {
                token_type: TokenType::Eof,
                value: "",
                line: 0,
            },
            previous: Token {
                token_type: TokenType::Eof,
                value: "",
                line: 0,
            },
            scanner: None,
            has_error: false,
            panic_mode: false,
            compilers: vec![],
            class_compilers: vec![],
            object_manager,
            intern_strings,
        });
        parser.init_compiler(FunctionType::Script);
        parser
    }

    /// Compile a whole source string into the implicit top-level function.
    /// Returns `None` if any compile error was reported along the way.
    pub fn compile(&mut self, source: &'a str) -> Option<Box<ObjectFunction>> {
        self.scanner = Some(Scanner::new(source));

        self.advance();

        while !self.match_token(TokenType::Eof) {
            self.declaration();
        }

        let function = self.end_compiler();
        if self.has_error {
            None
        } else {
            Some(function)
        }
    }

    fn specific_compiler(&self, compiler_index: usize) -> &Compiler<'a> {
        self.compilers.get(compiler_index).expect("compiler index is invalid")
    }

    fn specific_compiler_mut(&mut self, compiler_index: usize) -> &mut Compiler<'a> {
        self.compilers.get_mut(compiler_index).expect("compiler index is invalid")
    }

    fn current_compiler(&self) -> &Compiler<'a> {
        self.compilers.last().expect("no compiler")
    }

    fn current_compiler_mut(&mut self) -> &mut Compiler<'a> {
        self.compilers.last_mut().expect("no compiler")
    }

    fn current_function(&self) -> &ObjectFunction {
        &self.current_compiler().function
    }

    fn current_function_mut(&mut self) -> &mut ObjectFunction {
        &mut self.current_compiler_mut().function
    }

    fn current_chunk(&self) -> &Chunk {
        &self.current_function().chunk
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        &mut self.current_function_mut().chunk
    }

    fn current_locals(&self) -> &Vec<Local<'a>> {
        &self.current_compiler().locals
    }

    fn current_locals_mut(&mut self) -> &mut Vec<Local<'a>> {
        &mut self.current_compiler_mut().locals
    }

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            if let Some(scanner) = &mut self.scanner {
                self.current = scanner.scan_token();
                if self.current.token_type != TokenType::Error {
                    break;
                }

                let message = self.current.value;
                self.error_at_current(message);
            } else {
                panic!("Compiler was not initialized correctly.");
            }
        }
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }

        self.advance();
        true
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    fn consume(&mut self, token_type: TokenType, message: &str) {
        if self.current.token_type == token_type {
            self.advance();
            return;
        }

        self.error_at_current(message);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line as u32;
        self.current_chunk_mut().write(byte, line);
    }

    fn emit_bytes(&mut self, byte1: u8, byte2: u8) {
        self.emit_byte(byte1);
        self.emit_byte(byte2);
    }

    fn emit_constant(&mut self, value: Value) {
        let byte = self.make_constant(value);
        self.emit_bytes(OpCode::Constant.to_byte(), byte);
    }

    /// An initializer implicitly returns `this` (frame slot zero); everything
    /// else implicitly returns nil.
    fn emit_return(&mut self) {
        if self.current_compiler().function_type == FunctionType::Initializer {
            self.emit_bytes(OpCode::GetLocal.to_byte(), 0);
        } else {
            self.emit_byte(OpCode::Nil.to_byte());
        }
        self.emit_byte(OpCode::Return.to_byte());
    }

    fn init_compiler(&mut self, function_type: FunctionType) {
        let mut compiler = Compiler::new(function_type);
        // When compiling a function declaration, init_compiler runs right
        // after the function's name was parsed, so the name is the previous
        // token.
        if function_type != FunctionType::Script {
            compiler.function.name = self.previous.value.to_string();
        }

        // Stack slot zero is reserved for the callee. Methods and
        // initializers name it `this` so user code can resolve it; for plain
        // functions it is unnamed and unreachable.
        let slot_zero_name = match function_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            _ => "",
        };
        compiler.locals.push(Local {
            name: synthetic_token(slot_zero_name),
            depth: 0,
            is_captured: false,
        });
        self.compilers.push(compiler);
    }

    fn end_compiler(&mut self) -> Box<ObjectFunction> {
        self.emit_return();

        if self.current_function().name.is_empty() {
            debug_feature::disassemble_chunk(self, "<script>");
        } else {
            let function_name = self.current_function().name.clone();
            debug_feature::disassemble_chunk(self, &function_name);
        }

        let function = mem::replace(
            &mut self.current_compiler_mut().function,
            Box::new(ObjectFunction::new(0, String::new())),
        );
        self.compilers.pop();
        function
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_chunk().find_constant(value) {
            return index as u8;
        }

        let constant_index = self.current_chunk_mut().add_constant(value);
        if constant_index > u8::MAX.into() {
            self.error("Too many constants in one chunk");
            return 0;
        }
        constant_index as u8
    }

    fn number(&mut self) {
        let value = self.previous.value.parse::<f64>().unwrap_or(0.0);
        self.emit_constant(make_number_value(value));
    }

    fn string(&mut self) {
        // Trim the enclosing quotation marks off the lexeme.
        let content = &self.previous.value[1..self.previous.value.len() - 1];
        let value = make_string_value(self.object_manager, self.intern_strings, content);
        self.emit_constant(value);
    }

    fn declaration(&mut self) {
        if self.match_token(TokenType::Class) {
            self.class_declaration();
        } else if self.match_token(TokenType::Fun) {
            self.function_declaration();
        } else if self.match_token(TokenType::Var) {
            self.variable_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expected class name");
        let class_name = self.previous.clone();
        let name_constant = self.identifier_constant(class_name.clone());
        self.declare_variable();

        self.emit_bytes(OpCode::Class.to_byte(), name_constant);
        self.define_variable(name_constant);

        self.class_compilers.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expected superclass name");
            self.variable(false);

            if Self::identifier_equal(&class_name, &self.previous) {
                self.error("A class cannot inherit from itself");
            }

            // A scoped synthetic local keeps the superclass reachable so
            // `super` expressions in methods can capture it as an upvalue.
            self.begin_scope();
            self.add_local(synthetic_token("super"));
            self.define_variable(0);

            self.named_variable(class_name.clone(), false);
            self.emit_byte(OpCode::Inherit.to_byte());
            self.class_compilers
                .last_mut()
                .expect("class compiler present")
                .has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expected '{' before class body");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expected '}' after class body");
        self.emit_byte(OpCode::Pop.to_byte());

        if self
            .class_compilers
            .last()
            .expect("class compiler present")
            .has_superclass
        {
            self.end_scope();
        }
        self.class_compilers.pop();
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expected method name");
        let constant = self.identifier_constant(self.previous.clone());

        let function_type = if self.previous.value == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(function_type);

        self.emit_bytes(OpCode::Method.to_byte(), constant);
    }

    fn variable_declaration(&mut self) {
        let global = self.parse_variable("Expected variable name");

        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_byte(OpCode::Nil.to_byte());
        }
        self.consume(TokenType::Semicolon, "Expected ';' after 'var' declaration.");

        self.define_variable(global);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);

        self.declare_variable();
        if self.current_compiler().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.clone())
    }

    fn declare_variable(&mut self) {
        if self.current_compiler().scope_depth == 0 {
            // Globals are late-bound; nothing to reserve.
            return;
        }

        let mut err = false;
        let variable_name = self.previous.clone();
        let scope_depth = self.current_compiler().scope_depth;
        for local in self.current_locals().iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }

            if Self::identifier_equal(&variable_name, &local.name) {
                err = true;
                break;
            }
        }
        if err {
            self.error("Already a variable with this name in this scope");
        }

        self.add_local(variable_name);
    }

    fn add_local(&mut self, variable_name: Token<'a>) {
        if self.current_locals().len() > u8::MAX.into() {
            self.error("Too many local variables in function");
            return;
        }

        // depth -1 marks the variable as declared but not yet initialized;
        // mark_initialized patches it once the initializer has run.
        self.current_locals_mut().push(Local {
            name: variable_name,
            depth: -1,
            is_captured: false,
        });
    }

    fn function_declaration(&mut self) {
        let global = self.parse_variable("Expected function name");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType) {
        self.init_compiler(function_type);

        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expected '(' after function name");
        if !self.check(TokenType::RightParen) {
            loop {
                self.current_function_mut().arity += 1;
                if self.current_function().arity > 255 {
                    self.error_at_current("Cannot have more than 255 parameters");
                }
                let constant = self.parse_variable("Expected parameter name");
                self.define_variable(constant);

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expected ')' after function parameters");
        self.consume(TokenType::LeftBrace, "Expected '{' before function body");
        self.block();

        let upvalues = self.current_compiler().upvalues.clone();
        let function = self.end_compiler();

        let (function_ptr, _) = self.object_manager.adopt_function(function);
        let function_constant_index =
            self.make_constant(make_object_value(function_ptr as *mut Object));
        self.emit_bytes(OpCode::Closure.to_byte(), function_constant_index);

        for upvalue in upvalues.iter() {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argument_count: usize = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if argument_count >= 255 {
                    self.error("Cannot have more than 255 arguments");
                }
                argument_count += 1;

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expected ')' after arguments");
        argument_count as u8
    }

    fn identifier_constant(&mut self, token: Token) -> u8 {
        let value = make_string_value(self.object_manager, self.intern_strings, token.value);
        self.make_constant(value)
    }

    fn define_variable(&mut self, global: u8) {
        // Inside a scope the value simply stays on the stack as the local.
        if self.current_compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }

        self.emit_bytes(OpCode::DefineGlobal.to_byte(), global);
    }

    fn mark_initialized(&mut self) {
        let scope_depth = self.current_compiler().scope_depth;
        if scope_depth == 0 {
            return;
        }

        self.current_locals_mut()
            .last_mut()
            .expect("a local was just declared")
            .depth = scope_depth;
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.clone(), can_assign)
    }

    fn named_variable(&mut self, name: Token, can_assign: bool) {
        let mut opcode_get = OpCode::GetLocal.to_byte();
        let mut opcode_set = OpCode::SetLocal.to_byte();
        let current_compiler_index = self.compilers.len() - 1;
        let mut index = self.resolve_local(current_compiler_index, &name);
        if index == -1 {
            index = self.resolve_upvalue(current_compiler_index, &name);
            if index == -1 {
                // global variable
                index = self.identifier_constant(name) as i32;
                opcode_get = OpCode::GetGlobal.to_byte();
                opcode_set = OpCode::SetGlobal.to_byte();
            } else {
                // upvalue
                opcode_get = OpCode::GetUpvalue.to_byte();
                opcode_set = OpCode::SetUpvalue.to_byte();
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(opcode_set, index as u8);
        } else {
            self.emit_bytes(opcode_get, index as u8);
        }
    }

    fn resolve_local(&mut self, compiler_index: usize, name: &Token) -> i32 {
        let mut found: i32 = -1;
        let mut uninitialized = false;
        {
            let locals = &self.specific_compiler(compiler_index).locals;
            for (index, local) in locals.iter().enumerate().rev() {
                if Self::identifier_equal(name, &local.name) {
                    if local.depth == -1 {
                        uninitialized = true;
                    }
                    found = index as i32;
                    break;
                }
            }
        }

        if uninitialized {
            self.error("Can't read local variable within its own initializer");
        }
        found
    }

    fn identifier_equal(left: &Token, right: &Token) -> bool {
        // Lexeme comparison only: synthetic tokens (`this`, `super`) must
        // resolve against keyword-typed tokens with the same spelling.
        !left.value.is_empty() && left.value == right.value
    }

    /// Walk outward through the enclosing compilers. A name found as a local
    /// in some enclosing function is captured there and threaded back in as
    /// an upvalue through every intermediate function.
    fn resolve_upvalue(&mut self, compiler_index: usize, name: &Token) -> i32 {
        if compiler_index == 0 {
            return -1;
        }

        let local = self.resolve_local(compiler_index - 1, name);
        if local != -1 {
            self.specific_compiler_mut(compiler_index - 1).locals[local as usize].is_captured =
                true;
            return self.add_upvalue(compiler_index, local as u8, true);
        }

        let upvalue = self.resolve_upvalue(compiler_index - 1, name);
        if upvalue != -1 {
            return self.add_upvalue(compiler_index, upvalue as u8, false);
        }

        -1
    }

    fn add_upvalue(&mut self, compiler_index: usize, index: u8, is_local: bool) -> i32 {
        let compiler = self.specific_compiler(compiler_index);
        for (existing_index, upvalue) in compiler.upvalues.iter().enumerate() {
            if upvalue.is_local == is_local && upvalue.index == index {
                return existing_index as i32;
            }
        }

        if compiler.upvalues.len() > u8::MAX.into() {
            self.error("Too many closure variables in function");
            return 0;
        }

        let compiler = self.specific_compiler_mut(compiler_index);
        compiler.upvalues.push(Upvalue { index, is_local });
        compiler.function.upvalue_count = compiler.upvalues.len();
        (compiler.function.upvalue_count - 1) as i32
    }

    fn and(&mut self) {
        let jump_offset_operand = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());
        self.parse_precedence(Precedence::And);
        self.patch_jump_offset(jump_offset_operand);
    }

    fn or(&mut self) {
        // A falsy left side hops over the exit jump into the right operand.
        let else_jump_offset_operand = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        let end_jump_offset_operand = self.emit_jump_bytes(OpCode::Jump.to_byte());

        self.patch_jump_offset(else_jump_offset_operand);
        self.emit_byte(OpCode::Pop.to_byte());

        self.parse_precedence(Precedence::Or);
        self.patch_jump_offset(end_jump_offset_operand);
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::Print) {
            self.print_statement();
        } else {
            self.expression_statement();
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expected '(' after 'if'");
        self.expression();
        self.consume(TokenType::RightParen, "Expected ')' after 'if' condition");

        let jump_offset_operand = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte()); // condition, truthy path
        self.statement();

        let else_jump_offset_operand = self.emit_jump_bytes(OpCode::Jump.to_byte());
        self.patch_jump_offset(jump_offset_operand);
        self.emit_byte(OpCode::Pop.to_byte()); // condition, falsy path

        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump_offset(else_jump_offset_operand);
    }

    /// Emit a jump with a two-byte placeholder operand and return the
    /// operand's offset for later patching.
    fn emit_jump_bytes(&mut self, instruction: u8) -> usize {
        self.emit_byte(instruction);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump_offset(&mut self, offset: usize) {
        // -2 to adjust for the two bytes of the jump operand itself.
        let jump_offset = self.current_chunk().len() - offset - 2;
        if jump_offset > u16::MAX.into() {
            self.error("Too much code to jump over");
        }

        let current_chunk = self.current_chunk_mut();
        current_chunk.write_by_offset(offset, ((jump_offset >> 8) & 0xff) as u8);
        current_chunk.write_by_offset(offset + 1, (jump_offset & 0xff) as u8);
    }

    fn begin_scope(&mut self) {
        self.current_compiler_mut().scope_depth += 1
    }

    fn end_scope(&mut self) {
        self.current_compiler_mut().scope_depth -= 1;
        let scope_depth = self.current_compiler().scope_depth;
        loop {
            let current_locals = self.current_locals();
            if current_locals.is_empty() || current_locals.last().expect("non-empty").depth <= scope_depth
            {
                break;
            }

            // Captured locals migrate into their upvalue instead of dying.
            if current_locals.last().expect("non-empty").is_captured {
                self.emit_byte(OpCode::CloseUpvalue.to_byte());
            } else {
                self.emit_byte(OpCode::Pop.to_byte());
            }
            self.current_locals_mut().pop();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }

        self.consume(TokenType::RightBrace, "Expected '}' after block");
    }

    fn return_statement(&mut self) {
        if self.current_compiler().function_type == FunctionType::Script {
            self.error("Cannot return from top-level code");
        }

        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.current_compiler().function_type == FunctionType::Initializer {
                self.error("Cannot return a value from an initializer");
            }

            self.expression();
            self.consume(TokenType::Semicolon, "Expected ';' after 'return' value");
            self.emit_byte(OpCode::Return.to_byte());
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expected ';' after 'print' value");
        self.emit_byte(OpCode::Print.to_byte());
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();

        self.consume(TokenType::LeftParen, "Expected '(' after 'while'");
        self.expression();
        self.consume(TokenType::RightParen, "Expected ')' after 'while' condition");

        let jump_offset_operand = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());

        self.statement();
        self.emit_loop(loop_start); // back to the condition expression

        self.patch_jump_offset(jump_offset_operand);
        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(OpCode::Loop.to_byte());

        // +2 skips the operand of the Loop instruction itself.
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX.into() {
            self.error("Loop body is too large");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expected '(' after 'for'");
        if self.match_token(TokenType::Semicolon) {
            // no initializer
        } else if self.match_token(TokenType::Var) {
            self.variable_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump_offset_operand: Option<usize> = None;
        if !self.match_token(TokenType::Semicolon) {
            // condition clause
            self.expression();
            self.consume(TokenType::Semicolon, "Expected ';' after loop condition");

            // Jump out of the loop if the condition is false.
            exit_jump_offset_operand = Some(self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte()));
            self.emit_byte(OpCode::Pop.to_byte());
        }

        if !self.match_token(TokenType::RightParen) {
            // The increment clause textually precedes the body but runs
            // after it, so control hops over it on the way in.
            let body_jump_offset_operand = self.emit_jump_bytes(OpCode::Jump.to_byte());
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_byte(OpCode::Pop.to_byte());
            self.consume(TokenType::RightParen, "Expected ')' after 'for' clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump_offset(body_jump_offset_operand);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_offset) = exit_jump_offset_operand {
            self.patch_jump_offset(exit_offset);
            self.emit_byte(OpCode::Pop.to_byte());
        }
        self.end_scope();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expected ';' after expression");
        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expected ')' after expression");
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn unary(&mut self) {
        let operator_type = self.previous.token_type;

        self.parse_precedence(Precedence::Unary);

        match operator_type {
            TokenType::Bang => self.emit_byte(OpCode::Not.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Negate.to_byte()),
            _ => unreachable!("Expect unary operator."),
        }
    }

    fn binary(&mut self) {
        let operator_type = self.previous.token_type;
        let rule = &RULES[operator_type as usize];
        self.parse_precedence((rule.precedence as u8 + 1).into());

        match operator_type {
            TokenType::BangEqual => self.emit_bytes(OpCode::Equal.to_byte(), OpCode::Not.to_byte()),
            TokenType::EqualEqual => self.emit_byte(OpCode::Equal.to_byte()),
            TokenType::Greater => self.emit_byte(OpCode::Greater.to_byte()),
            TokenType::GreaterEqual => self.emit_bytes(OpCode::Less.to_byte(), OpCode::Not.to_byte()),
            TokenType::Less => self.emit_byte(OpCode::Less.to_byte()),
            TokenType::LessEqual => self.emit_bytes(OpCode::Greater.to_byte(), OpCode::Not.to_byte()),
            TokenType::Plus => self.emit_byte(OpCode::Add.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Subtract.to_byte()),
            TokenType::Star => self.emit_byte(OpCode::Multiply.to_byte()),
            TokenType::Slash => self.emit_byte(OpCode::Divide.to_byte()),
            _ => unreachable!("Unexpected binary operator: {}", operator_type),
        }
    }

    fn literal(&mut self) {
        let operator_type = self.previous.token_type;
        match operator_type {
            TokenType::False => self.emit_byte(OpCode::False.to_byte()),
            TokenType::True => self.emit_byte(OpCode::True.to_byte()),
            TokenType::Nil => self.emit_byte(OpCode::Nil.to_byte()),
            _ => unreachable!("Unexpected literal operator: {}", operator_type),
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let argument_count = self.argument_list();
        self.emit_bytes(OpCode::Call.to_byte(), argument_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expected property name after '.'");
        let name_constant = self.identifier_constant(self.previous.clone());

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty.to_byte(), name_constant);
        } else if self.match_token(TokenType::LeftParen) {
            // Property call: skip the intermediate bound method.
            let argument_count = self.argument_list();
            self.emit_bytes(OpCode::Invoke.to_byte(), name_constant);
            self.emit_byte(argument_count);
        } else {
            self.emit_bytes(OpCode::GetProperty.to_byte(), name_constant);
        }
    }

    fn this(&mut self) {
        if self.class_compilers.is_empty() {
            self.error("Cannot use 'this' outside of a class");
            return;
        }

        self.variable(false);
    }

    fn super_(&mut self) {
        if self.class_compilers.is_empty() {
            self.error("Cannot use 'super' outside of a class");
        } else if !self
            .class_compilers
            .last()
            .expect("class compiler present")
            .has_superclass
        {
            self.error("Cannot use 'super' in a class with no superclass");
        }

        self.consume(TokenType::Dot, "Expected '.' after 'super'");
        self.consume(TokenType::Identifier, "Expected superclass method name");
        let name_constant = self.identifier_constant(self.previous.clone());

        self.named_variable(synthetic_token("this"), false);
        if self.match_token(TokenType::LeftParen) {
            let argument_count = self.argument_list();
            self.named_variable(synthetic_token("super"), false);
            self.emit_bytes(OpCode::SuperInvoke.to_byte(), name_constant);
            self.emit_byte(argument_count);
        } else {
            self.named_variable(synthetic_token("super"), false);
            self.emit_bytes(OpCode::GetSuper.to_byte(), name_constant);
        }
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;
        if let Some(prefix) = &RULES[self.previous.token_type as usize].prefix {
            prefix(self, can_assign);
        } else {
            self.error("Expected expression");
            return;
        }

        while precedence as u8 <= RULES[self.current.token_type as usize].precedence as u8 {
            self.advance();
            if let Some(infix) = &RULES[self.previous.token_type as usize].infix {
                infix(self, can_assign);
            } else {
                self.error("Expect infix parse function.");
                return;
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.token_type != TokenType::Eof {
            if self.previous.token_type == TokenType::Semicolon {
                return;
            }

            match self.current.token_type {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => (),
            }

            self.advance()
        }
    }

    fn error(&mut self, message: &str) {
        self.error_at(&self.previous.clone(), message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(&self.current.clone(), message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }

        self.panic_mode = true;
        eprint!("[line {}] Error", token.line);

        match token.token_type {
            TokenType::Eof => eprint!(" at end"),
            TokenType::Error => {}
            _ => eprint!(" at '{}'", token.value),
        };

        eprintln!(": {}", message);
        self.has_error = true;
    }
}

#[cfg(feature = "debug_print_code")]
mod debug_feature {
    use crate::debug;

    use super::*;

    pub fn disassemble_chunk(parser: &Parser, name: &str) {
        if !parser.has_error {
            debug::disassemble_chunk(parser.current_chunk(), name);
        }
    }
}

#[cfg(not(feature = "debug_print_code"))]
mod debug_feature {
    use super::*;

    pub fn disassemble_chunk(_parser: &Parser, _name: &str) {}
}
