//! MicroPascal compiler library
//!
//! Single-pass compilation of MicroPascal sources to 32-bit x86 assembly in
//! Intel/MASM syntax, assembled and linked externally against the C library's
//! `printf`.
//!
//! Pipeline: [`Scanner`] feeds tokens on demand to the [`Parser`], which
//! builds the AST and symbol tables, type-checks and folds constants in one
//! traversal; [`codegen::generate`] lowers the result to a linear instruction
//! list; [`optimizer::optimize`] rewrites that list to a fixpoint; the writer
//! serializes it to text.
//!
//! The command modes of the `mpasc` binary map to the entry points here:
//! token dump ([`lex_source`]), parse-tree dump ([`parse_source`]), plain and
//! optimized code generation ([`compile_source`]).
//!
//! Every error is fatal and carries a single diagnostic line; see
//! [`CompileError`].

pub mod asm;
pub mod ast;
pub mod codegen;
pub mod config;
pub mod error;
pub mod optimizer;
pub mod parser;
pub mod scanner;
pub mod symbol;
pub mod token;

pub use config::{CompilerConfig, derive_output_name};
pub use error::{CompileError, Result};
pub use parser::{Parser, Program};
pub use scanner::Scanner;
pub use token::{Token, TokenKind};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Command modes of the compiler driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// `-l`: dump tokens, one per line.
    Lex,
    /// `-p`: dump the parse tree, then the symbol tables.
    Parse,
    /// `-g`: generate assembly.
    Generate,
    /// `-o`: generate assembly, then peephole-optimize.
    Optimize,
}

/// Token dump for `-l`: one line per token.
pub fn lex_source(source: &str) -> Result<String> {
    let mut scanner = Scanner::new(source);
    let mut out = String::new();
    loop {
        let token = scanner.next()?;
        if token.kind == TokenKind::Eof {
            break;
        }
        out.push_str(&token.dump_line());
        out.push('\n');
    }
    Ok(out)
}

/// Parse-tree and symbol-table dump for `-p`.
pub fn parse_source(source: &str) -> Result<String> {
    let program = Parser::new(source).parse()?;
    Ok(program.dump())
}

/// Full compilation to assembly text; `config.optimize` selects `-o`.
pub fn compile_source(source: &str, config: &CompilerConfig) -> Result<String> {
    let program = Parser::new(source).parse()?;
    debug!("parsed program");
    let mut instrs = codegen::generate(&program, &config.include_dir);
    if config.optimize {
        optimizer::optimize(&mut instrs);
    }
    Ok(asm::render_all(&instrs))
}

/// Run one command mode over a source string.
pub fn run_mode(source: &str, mode: Mode, config: &CompilerConfig) -> Result<String> {
    match mode {
        Mode::Lex => lex_source(source),
        Mode::Parse => parse_source(source),
        Mode::Generate => {
            let config = config.clone().with_optimize(false);
            compile_source(source, &config)
        }
        Mode::Optimize => {
            let config = config.clone().with_optimize(true);
            compile_source(source, &config)
        }
    }
}

/// Compile `input` and write the result next to it (last three characters of
/// the name replaced by `asm`, unless `output` overrides the path).
///
/// Returns `Ok(true)` on success. A compile error is written as the single
/// line of the output file and yields `Ok(false)`; only the input/output I/O
/// failures surface as `Err`.
pub fn compile_file(
    input: &Path,
    output: Option<&Path>,
    mode: Mode,
    config: &CompilerConfig,
) -> io::Result<bool> {
    let source = fs::read_to_string(input)?;
    let out_path: PathBuf = match output {
        Some(p) => p.to_path_buf(),
        None => derive_output_name(input),
    };
    match run_mode(&source, mode, config) {
        Ok(text) => {
            fs::write(&out_path, text)?;
            Ok(true)
        }
        Err(err) => {
            fs::write(&out_path, format!("{}\n", err))?;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = "var a : integer;\nbegin a := 2 + 3 * 4 end.";

    #[test]
    fn test_lex_source_lines() {
        let out = lex_source("begin end.").unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("keyword begin"));
        assert!(lines[2].contains("divider ."));
    }

    #[test]
    fn test_parse_source_dumps_tree_and_tables() {
        let out = parse_source(SCENARIO).unwrap();
        assert!(out.contains("begin"));
        assert!(out.contains(":="));
        assert!(out.contains("14"));
        assert!(out.contains("a\tinteger"));
    }

    #[test]
    fn test_parse_acceptance_implies_generate_acceptance() {
        let sources = [
            SCENARIO,
            "var x : double; begin x := 1 + 2.5 end.",
            "function f(n : integer) : integer; begin f := n end;\nbegin f(2) end.",
            "var i, j : integer;\nbegin for i := 1 to 3 do for j := 1 to 3 do if j = 2 then break;\nend.",
        ];
        for source in sources {
            parse_source(source).unwrap();
            run_mode(source, Mode::Generate, &CompilerConfig::default()).unwrap();
        }
    }

    #[test]
    fn test_optimized_output_is_smaller_or_equal() {
        let plain = run_mode(SCENARIO, Mode::Generate, &CompilerConfig::default()).unwrap();
        let optimized = run_mode(SCENARIO, Mode::Optimize, &CompilerConfig::default()).unwrap();
        assert!(optimized.lines().count() <= plain.lines().count());
    }

    #[test]
    fn test_optimizer_turns_push_pop_into_mov() {
        let plain = run_mode(SCENARIO, Mode::Generate, &CompilerConfig::default()).unwrap();
        let optimized = run_mode(SCENARIO, Mode::Optimize, &CompilerConfig::default()).unwrap();
        // The address push / pop esi pair of the store collapses to a mov.
        assert!(plain.contains("\tpush\toffset v_a\n\tpop\tesi\n"));
        assert!(optimized.contains("\tmov\tesi, offset v_a\n"));
        assert!(!optimized.contains("\tpush\toffset v_a\n"));
    }

    #[test]
    fn test_constant_deduplication_end_to_end() {
        let source = "var x, y : double;\nbegin x := 3.14; y := 3.14 end.";
        let optimized = run_mode(source, Mode::Optimize, &CompilerConfig::default()).unwrap();
        assert_eq!(optimized.matches("dq 3.14").count(), 1);
        // Both stores read the surviving constant.
        assert_eq!(optimized.matches("qword ptr dc_1").count(), 2);
        assert!(!optimized.contains("dc_2"));
    }

    #[test]
    fn test_error_line_format() {
        let err = run_mode(
            "begin x := 1 end.",
            Mode::Generate,
            &CompilerConfig::default(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error at line 1: Undeclared identifier: \"x\""
        );
    }

    #[test]
    fn test_custom_include_dir() {
        let config = CompilerConfig::default().with_include_dir("rt");
        let out = compile_source("begin end.", &config).unwrap();
        assert!(out.starts_with("include rt\\start.inc\n"));
        assert!(out.contains("include rt\\end.inc\n"));
    }

    #[test]
    fn test_compile_file_writes_asm_next_to_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("prog.pas");
        fs::write(&input, SCENARIO).unwrap();
        let ok = compile_file(&input, None, Mode::Optimize, &CompilerConfig::default()).unwrap();
        assert!(ok);
        let out = fs::read_to_string(dir.path().join("prog.asm")).unwrap();
        assert!(out.contains("push\t14"));
        assert!(out.ends_with("end start"));
    }

    #[test]
    fn test_compile_file_writes_diagnostic_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bad.pas");
        fs::write(&input, "begin x := 1 end.").unwrap();
        let ok = compile_file(&input, None, Mode::Generate, &CompilerConfig::default()).unwrap();
        assert!(!ok);
        let out = fs::read_to_string(dir.path().join("bad.asm")).unwrap();
        assert_eq!(out, "Error at line 1: Undeclared identifier: \"x\"\n");
    }

    #[test]
    fn test_missing_input_is_io_error() {
        let missing = Path::new("/nonexistent/input.pas");
        assert!(compile_file(missing, None, Mode::Generate, &CompilerConfig::default()).is_err());
    }
}
