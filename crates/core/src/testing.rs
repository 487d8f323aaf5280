//! Message fixtures shared by unit tests.

pub const ORU_HR: &str = r"MSH|^~\&|LEGACY_PAS|LEEDS_GEN|SENTINEL|NHS_TRUST|202401050930||ORU^R01|482913|P|2.3
PID|1||9434767067^^^NHS||SMITH^John^^^MR||19800101|M|||1 High St^^Leeds^^LS1 4AP||0113 496 0000
OBR|1|||VITALS^Vital signs|||202401050930
OBX|1|NM|8867-4^HEART RATE^LN||72|/min|||||F";

pub const ORU_BP: &str = r"MSH|^~\&|LEGACY_PAS|LEEDS_GEN|SENTINEL|NHS_TRUST|202401051015||ORU^R01|771001|P|2.3
PID|1||9434767067^^^NHS||SMITH^John^^^MR||19800101|M
OBR|1|||VITALS^Vital signs|||202401051015
OBX|1|NM|8480-6^SYSTOLIC BP^LN||128|mm[Hg]|||||F
OBX|2|NM|8462-4^DIASTOLIC BP^LN||84|mm[Hg]|||||F";

pub const ADT_A01: &str = r"MSH|^~\&|LEGACY_PAS|LEEDS_GEN|SENTINEL|NHS_TRUST|202401050800||ADT^A01|553201|P|2.3
EVN|A01|202401050800
PID|1||9434767067^^^NHS||SMITH^John^^^MR||19800101|M|||1 High St^^Leeds^^LS1 4AP||0113 496 0000
PV1|1|I|A\T\E^12^3||||123^SMITH^DR
AL1|1|DA|Z88.0^PENICILLIN^CD|SV|Anaphylaxis~Hives";

/// Heart-rate result with the given control id, patient identifier and `OBX-5` value.
pub fn hr_message(control_id: &str, nhs_number: &str, value: &str) -> String {
    format!(
        "MSH|^~\\&|LEGACY_PAS|LEEDS_GEN|SENTINEL|NHS_TRUST|202401050930||ORU^R01|{control_id}|P|2.3\n\
         PID|1||{nhs_number}^^^NHS||SMITH^John^^^MR||19800101|M\n\
         OBR|1|||VITALS^Vital signs|||202401050930\n\
         OBX|1|NM|8867-4^HEART RATE^LN||{value}|/min|||||F"
    )
}

/// Blood-pressure result with the given control id and systolic/diastolic values.
pub fn bp_message(control_id: &str, systolic: &str, diastolic: &str) -> String {
    format!(
        "MSH|^~\\&|LEGACY_PAS|LEEDS_GEN|SENTINEL|NHS_TRUST|202401051015||ORU^R01|{control_id}|P|2.3\n\
         PID|1||9434767067^^^NHS||SMITH^John^^^MR||19800101|M\n\
         OBR|1|||VITALS^Vital signs|||202401051015\n\
         OBX|1|NM|8480-6^SYSTOLIC BP^LN||{systolic}|mm[Hg]|||||F\n\
         OBX|2|NM|8462-4^DIASTOLIC BP^LN||{diastolic}|mm[Hg]|||||F"
    )
}

/// Admission-family message for `trigger` (`A01`, `A03`, `A08`).
pub fn adt_message(trigger: &str, nhs_number: &str) -> String {
    format!(
        "MSH|^~\\&|LEGACY_PAS|LEEDS_GEN|SENTINEL|NHS_TRUST|202401050800||ADT^{trigger}|553201|P|2.3\n\
         EVN|{trigger}|202401050800\n\
         PID|1||{nhs_number}^^^NHS||SMITH^John^^^MR||19800101|M|||1 High St^^Leeds^^LS1 4AP||0113 496 0000\n\
         PV1|1|I|A\\T\\E^12^3||||123^SMITH^DR\n\
         AL1|1|DA|Z88.0^PENICILLIN^CD|SV|Anaphylaxis~Hives"
    )
}
