//! Disassembler: renders compiled code objects for inspection. Pure
//! presentation — it reads the heap and the global table but never mutates
//! anything. The REPL exposes it behind the `:dis` command.

use crate::Error;
use crate::global::GlobalTable;
use crate::heap::Heap;
use crate::opcode::*;
use crate::value::{CodeObject, ObjRef};

pub struct Disassembler<'a> {
    heap: &'a Heap,
    globals: &'a GlobalTable,
}

impl<'a> Disassembler<'a> {
    pub fn new(heap: &'a Heap, globals: &'a GlobalTable) -> Self {
        Disassembler { heap, globals }
    }

    /// Disassembles one code object into a printable listing.
    pub fn disassemble(&self, co_ref: ObjRef) -> Result<String, Error> {
        let co = self.heap.code(co_ref)?;
        let mut out = format!(
            "\n---------- Disassembly: {} ----------\n\n",
            co.name
        );
        let mut offset = 0;
        while offset < co.code.len() {
            offset = self.instruction(co, offset, &mut out)?;
            out.push('\n');
        }
        Ok(out)
    }

    fn instruction(&self, co: &CodeObject, offset: usize, out: &mut String) -> Result<usize, Error> {
        out.push_str(&format!("{offset:04X}     "));
        let opcode = co.code[offset];
        match opcode {
            OP_HALT | OP_ADD | OP_SUB | OP_MUL | OP_DIV | OP_POP | OP_RETURN | OP_NEW => {
                self.dump_bytes(co, offset, 1, out);
                Self::mnemonic(opcode, out);
                Ok(offset + 1)
            }
            OP_SCOPE_EXIT | OP_CALL | OP_MAKE_FUNCTION => {
                self.dump_bytes(co, offset, 2, out);
                Self::mnemonic(opcode, out);
                out.push_str(&format!("{}", co.code[offset + 1]));
                Ok(offset + 2)
            }
            OP_CONST | OP_GET_PROP | OP_SET_PROP => {
                self.dump_bytes(co, offset, 2, out);
                Self::mnemonic(opcode, out);
                let idx = co.code[offset + 1] as usize;
                let annotation = co
                    .constants
                    .get(idx)
                    .map(|c| self.heap.constant_to_string(*c))
                    .unwrap_or_else(|| "?".to_owned());
                out.push_str(&format!("{idx} ({annotation})"));
                Ok(offset + 2)
            }
            OP_COMPARE => {
                self.dump_bytes(co, offset, 2, out);
                Self::mnemonic(opcode, out);
                let code = co.code[offset + 1] as usize;
                let annotation = COMPARE_OPS.get(code).copied().unwrap_or("?");
                out.push_str(&format!("{code} ({annotation})"));
                Ok(offset + 2)
            }
            OP_GET_GLOBAL | OP_SET_GLOBAL => {
                self.dump_bytes(co, offset, 2, out);
                Self::mnemonic(opcode, out);
                let idx = co.code[offset + 1] as usize;
                let annotation = self
                    .globals
                    .get(idx)
                    .map(|var| var.name.clone())
                    .unwrap_or_else(|_| "?".to_owned());
                out.push_str(&format!("{idx} ({annotation})"));
                Ok(offset + 2)
            }
            OP_GET_LOCAL | OP_SET_LOCAL => {
                self.dump_bytes(co, offset, 2, out);
                Self::mnemonic(opcode, out);
                let idx = co.code[offset + 1] as usize;
                // The locals scratch stack is drained by compile-time scope
                // exits, so names are best-effort here
                match co.locals.get(idx) {
                    Some(local) => out.push_str(&format!("{idx} ({})", local.name)),
                    None => out.push_str(&format!("{idx}")),
                }
                Ok(offset + 2)
            }
            OP_GET_CELL | OP_SET_CELL | OP_LOAD_CELL => {
                self.dump_bytes(co, offset, 2, out);
                Self::mnemonic(opcode, out);
                let idx = co.code[offset + 1] as usize;
                match co.cell_names.get(idx) {
                    Some(name) => out.push_str(&format!("{idx} ({name})")),
                    None => out.push_str(&format!("{idx}")),
                }
                Ok(offset + 2)
            }
            OP_JMP | OP_JMP_IF_FALSE => {
                self.dump_bytes(co, offset, 3, out);
                Self::mnemonic(opcode, out);
                let address =
                    ((co.code[offset + 1] as u16) << 8) | co.code[offset + 2] as u16;
                out.push_str(&format!("{address:04X}"));
                Ok(offset + 3)
            }
            unknown => Err(Error::UnknownOpcode(unknown)),
        }
    }

    /// Raw byte dump, left-padded into a fixed-width column.
    fn dump_bytes(&self, co: &CodeObject, offset: usize, count: usize, out: &mut String) {
        let mut bytes = String::new();
        for i in 0..count {
            bytes.push_str(&format!("{:02X} ", co.code[offset + i]));
        }
        out.push_str(&format!("{bytes:<12}"));
    }

    fn mnemonic(opcode: u8, out: &mut String) {
        out.push_str(&format!("{:<20} ", opcode_to_string(opcode)));
    }
}
