use iced_x86::{Decoder, DecoderOptions, Instruction};

/// Opcode of `jmp rel8`
pub const JMP_REL8: u8 = 0xEB;
/// Opcode of `je rel8`
pub const JE_REL8: u8 = 0x74;
/// Longest encodable x86 instruction
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Decodes the first instruction of `code` as if it lived at `ip`
pub fn decode(code: &[u8], ip: u64) -> Instruction {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    decoder.decode()
}

/// Whether `instruction` is an unprefixed two byte `jcc rel8` / `jmp rel8`.
///
/// Only these can have their opcode swapped for [`JMP_REL8`] while keeping the rel8 operand valid.
pub fn is_short_branch(instruction: &Instruction) -> bool {
    !instruction.is_invalid()
        && instruction.len() == 2
        && (instruction.is_jcc_short() || instruction.is_jmp_short())
}
