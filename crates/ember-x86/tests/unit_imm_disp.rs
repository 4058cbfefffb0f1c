use ember_x86::{decode_one, DecodeError, DecodeMode, Decoded};

fn decode64(bytes: &[u8]) -> Decoded {
    decode_one(DecodeMode::Long, bytes).expect("decode")
}

#[test]
fn mov_imm_width_tracks_operand_size() {
    // B8 iv: 16/32/64-bit zero-extended immediates.
    let d = decode64(&[0xB8, 0x78, 0x56, 0x34, 0x12]);
    assert_eq!(d.len(), 5);
    assert_eq!(d.uimm, 0x12345678);

    let d = decode64(&[0x66, 0xB8, 0x34, 0x12]);
    assert_eq!(d.len(), 4);
    assert_eq!(d.uimm, 0x1234);

    let d = decode64(&[
        0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11,
    ]);
    assert_eq!(d.len(), 10);
    assert_eq!(d.uimm, 0x1122334455667788);
}

#[test]
fn sign_extended_imm8_forms() {
    // 6A FF => push -1
    let d = decode64(&[0x6A, 0xFF]);
    assert_eq!(d.len(), 2);
    assert_eq!(d.uimm as i64, -1);

    // 83 C0 F8 => add eax, -8
    let d = decode64(&[0x83, 0xC0, 0xF8]);
    assert_eq!(d.len(), 3);
    assert_eq!(d.uimm as i64, -8);

    // B0 FF => mov al, 0xFF is zero-extended.
    let d = decode64(&[0xB0, 0xFF]);
    assert_eq!(d.uimm, 0xFF);
}

#[test]
fn push_imm32_stays_32_bits_wide_in_long_mode() {
    // 68 id: the operand size defaults to 64 but the immediate stays immz.
    let d = decode64(&[0x68, 0x78, 0x56, 0x34, 0x12]);
    assert_eq!(d.len(), 5);
    assert_eq!(d.uimm, 0x12345678);
}

#[test]
fn group_f6_f7_immediates_resolve_by_modrm_reg() {
    // F6 /0 (test) carries imm8.
    let d = decode64(&[0xF6, 0xC0, 0x7F]);
    assert_eq!(d.len(), 3);
    assert_eq!(d.uimm, 0x7F);

    // F6 /3 (neg) carries none.
    let d = decode64(&[0xF6, 0xD8]);
    assert_eq!(d.len(), 2);

    // F7 /0 (test) carries immz.
    let d = decode64(&[0xF7, 0xC0, 0x44, 0x33, 0x22, 0x11]);
    assert_eq!(d.len(), 6);
    assert_eq!(d.uimm, 0x11223344);

    // F7 /2 (not) carries none.
    let d = decode64(&[0xF7, 0xD0]);
    assert_eq!(d.len(), 2);
}

#[test]
fn group_c7_immediate_resolves_by_modrm_reg() {
    // C7 /0 => mov dword ptr [rax], imm32
    let d = decode64(&[0xC7, 0x00, 0x44, 0x33, 0x22, 0x11]);
    assert_eq!(d.len(), 6);
    assert_eq!(d.uimm, 0x11223344);
}

#[test]
fn enter_carries_both_immediates() {
    // C8 20 00 01 => enter 0x20, 1
    let d = decode64(&[0xC8, 0x20, 0x00, 0x01]);
    assert_eq!(d.len(), 4);
    assert_eq!(d.uimm, 0x20);
    assert_eq!(d.uimm1, 1);
}

#[test]
fn relative_branch_displacements() {
    // 74 0B => je +11
    let d = decode64(&[0x74, 0x0B]);
    assert_eq!(d.len(), 2);
    assert_eq!(d.disp, 0x0B);

    // EB EA => jmp -22
    let d = decode64(&[0xEB, 0xEA]);
    assert_eq!(d.disp, -22);

    // E8 rel32 is always 32 bits wide in long mode, even with a 66 prefix.
    let d = decode64(&[0xE8, 0x00, 0x01, 0x00, 0x00]);
    assert_eq!(d.len(), 5);
    assert_eq!(d.disp, 0x100);
    let d = decode64(&[0x66, 0xE8, 0x00, 0x01, 0x00, 0x00]);
    assert_eq!(d.len(), 6);

    // 0F 84 rel32
    let d = decode64(&[0x0F, 0x84, 0x80, 0x00, 0x00, 0x00]);
    assert_eq!(d.len(), 6);
    assert_eq!(d.disp, 0x80);

    // ...but 16 bits in real mode.
    let d = decode_one(DecodeMode::Real, &[0xE8, 0x00, 0x01]).expect("decode");
    assert_eq!(d.len(), 3);
    assert_eq!(d.disp, 0x100);
}

#[test]
fn absolute_offset_mov_is_address_sized_and_unsigned() {
    // A1 moffs: 8 bytes of offset in long mode.
    let d = decode64(&[0xA1, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x81]);
    assert_eq!(d.len(), 9);
    assert_eq!(d.disp as u64, 0x8122334455667788);

    // With a 67 prefix the offset shrinks to 4 bytes and stays unsigned.
    let d = decode64(&[0x67, 0xA1, 0x88, 0x77, 0x66, 0xF5]);
    assert_eq!(d.len(), 6);
    assert_eq!(d.disp, 0xF566_7788);
}

#[test]
fn shift_group_imm8_is_unsigned() {
    // C1 E0 1F => shl eax, 31
    let d = decode64(&[0xC1, 0xE0, 0x1F]);
    assert_eq!(d.len(), 3);
    assert_eq!(d.uimm, 31);
}

#[test]
fn truncated_instructions_report_too_short() {
    assert_eq!(
        decode_one(DecodeMode::Long, &[]).unwrap_err(),
        DecodeError::TooShort(0)
    );
    assert_eq!(
        decode_one(DecodeMode::Long, &[0x66]).unwrap_err(),
        DecodeError::TooShort(1)
    );
    assert_eq!(
        decode_one(DecodeMode::Long, &[0x8B]).unwrap_err(),
        DecodeError::TooShort(1)
    );
    assert_eq!(
        decode_one(DecodeMode::Long, &[0xB8, 0x01, 0x02]).unwrap_err(),
        DecodeError::TooShort(3)
    );
    assert_eq!(
        decode_one(DecodeMode::Long, &[0x8B, 0x84, 0x8B, 0x78]).unwrap_err(),
        DecodeError::TooShort(4)
    );
}

#[test]
fn over_long_encodings_report_instr_too_long() {
    // Fourteen 66 prefixes leave no room for ADD Ev,Gv to finish.
    let mut bytes = [0x66u8; 16];
    bytes[14] = 0x01;
    bytes[15] = 0xC8;
    assert_eq!(
        decode_one(DecodeMode::Long, &bytes).unwrap_err(),
        DecodeError::InstrTooLong
    );
}

#[test]
fn reserved_escapes_report_bad_map() {
    for second in [0x0F, 0x39, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F] {
        assert_eq!(
            decode_one(DecodeMode::Long, &[0x0F, second, 0x00, 0x00]).unwrap_err(),
            DecodeError::BadMap,
            "0F {second:02X} should be a bad map"
        );
    }
}
