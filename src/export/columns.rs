//! Column layout of each exportable entity.

use std::fmt;
use std::str::FromStr;

use super::ExportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub header: &'static str,
    pub key: &'static str,
    pub required: bool,
}

const fn col(header: &'static str, key: &'static str, required: bool) -> Column {
    Column {
        header,
        key,
        required,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Students,
    Teachers,
    Staff,
    Parents,
    Users,
}

const STUDENTS: &[Column] = &[
    col("Prénom", "first_name", true),
    col("Nom", "last_name", true),
    col("Date de naissance", "date_of_birth", false),
    col("Sexe", "gender", false),
    col("Classe", "class_name", false),
    col("Nom du parent", "parent_name", false),
    col("Téléphone du parent", "parent_phone", true),
    col("Email du parent", "parent_email", false),
    col("Adresse", "address", false),
];

const TEACHERS: &[Column] = &[
    col("Prénom", "first_name", true),
    col("Nom", "last_name", true),
    col("Email", "email", true),
    col("Téléphone", "phone", false),
    col("Matière", "subject", false),
    col("Classe", "class_name", false),
];

const STAFF: &[Column] = &[
    col("Prénom", "first_name", true),
    col("Nom", "last_name", true),
    col("Email", "email", true),
    col("Téléphone", "phone", false),
    col("Rôle", "role", true),
    col("Poste", "position", false),
];

const PARENTS: &[Column] = &[
    col("Prénom", "first_name", true),
    col("Nom", "last_name", true),
    col("Téléphone", "phone", true),
    col("Email", "email", false),
    col("Enfant(s)", "children", false),
    col("Adresse", "address", false),
];

const USERS: &[Column] = &[
    col("Nom complet", "full_name", true),
    col("Email", "email", false),
    col("Téléphone", "phone", false),
    col("Rôle", "role", true),
    col("Actif", "is_active", false),
    col("Créé le", "created_at", false),
];

const STUDENT_EXAMPLES: &[&[&str]] = &[
    &["Aminata", "Diallo", "2014-03-12", "F", "CM1", "Oumar Diallo", "+221 77 123 45 67", "oumar.diallo@example.com", "Dakar, Médina"],
    &["Ibrahima", "Sarr", "2013-11-02", "M", "CM2", "Khady Sarr", "+221 76 234 56 78", "", "Thiès"],
];

const TEACHER_EXAMPLES: &[&[&str]] = &[
    &["Fatou", "Ndiaye", "fatou.ndiaye@example.com", "+221 77 345 67 89", "Mathématiques", "CM1"],
    &["Moussa", "Fall", "moussa.fall@example.com", "", "Français", ""],
];

const STAFF_EXAMPLES: &[&[&str]] = &[
    &["Awa", "Ba", "awa.ba@example.com", "+221 78 456 78 90", "secretary", "Secrétariat"],
    &["Cheikh", "Gueye", "cheikh.gueye@example.com", "", "teacher", ""],
];

const PARENT_EXAMPLES: &[&[&str]] = &[
    &["Oumar", "Diallo", "+221 77 123 45 67", "oumar.diallo@example.com", "Aminata Diallo", "Dakar, Médina"],
    &["Khady", "Sarr", "+221 76 234 56 78", "", "Ibrahima Sarr", "Thiès"],
];

const USER_EXAMPLES: &[&[&str]] = &[
    &["Mariama Sow", "mariama.sow@example.com", "+221 77 567 89 01", "principal", "true", ""],
    &["Abdou Kane", "abdou.kane@example.com", "", "teacher", "true", ""],
];

impl Entity {
    pub const ALL: [Entity; 5] = [
        Entity::Students,
        Entity::Teachers,
        Entity::Staff,
        Entity::Parents,
        Entity::Users,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Students => "students",
            Entity::Teachers => "teachers",
            Entity::Staff => "staff",
            Entity::Parents => "parents",
            Entity::Users => "users",
        }
    }

    /// Title used for sheets and PDF headings.
    pub fn label(&self) -> &'static str {
        match self {
            Entity::Students => "Élèves",
            Entity::Teachers => "Enseignants",
            Entity::Staff => "Personnel",
            Entity::Parents => "Parents",
            Entity::Users => "Utilisateurs",
        }
    }

    pub fn columns(&self) -> &'static [Column] {
        match self {
            Entity::Students => STUDENTS,
            Entity::Teachers => TEACHERS,
            Entity::Staff => STAFF,
            Entity::Parents => PARENTS,
            Entity::Users => USERS,
        }
    }

    pub(crate) fn example_rows(&self) -> &'static [&'static [&'static str]] {
        match self {
            Entity::Students => STUDENT_EXAMPLES,
            Entity::Teachers => TEACHER_EXAMPLES,
            Entity::Staff => STAFF_EXAMPLES,
            Entity::Parents => PARENT_EXAMPLES,
            Entity::Users => USER_EXAMPLES,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Entity {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Entity::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ExportError::UnknownEntity(s.to_string()))
    }
}

impl Column {
    /// Header as written in import templates.
    pub fn template_header(&self) -> String {
        if self.required {
            format!("{} *", self.header)
        } else {
            self.header.to_string()
        }
    }
}

fn fold_char(c: char) -> &'static str {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "A",
        'æ' => "ae",
        'Æ' => "AE",
        'ç' => "c",
        'Ç' => "C",
        'è' | 'é' | 'ê' | 'ë' => "e",
        'È' | 'É' | 'Ê' | 'Ë' => "E",
        'ì' | 'í' | 'î' | 'ï' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' => "I",
        'ñ' => "n",
        'Ñ' => "N",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => "O",
        'œ' => "oe",
        'Œ' => "OE",
        'ù' | 'ú' | 'û' | 'ü' => "u",
        'Ù' | 'Ú' | 'Û' | 'Ü' => "U",
        'ý' | 'ÿ' => "y",
        'Ý' | 'Ÿ' => "Y",
        _ => "",
    }
}

/// Strip the required marker, fold accents and snake_case a header:
/// `"Téléphone du parent *"` becomes `"telephone_du_parent"`.
pub fn normalize_header(header: &str) -> String {
    let trimmed = header.trim().trim_end_matches('*').trim();
    let mut out = String::with_capacity(trimmed.len());
    let mut pending_sep = false;
    for c in trimmed.chars() {
        let folded = fold_char(c);
        let piece: String = if folded.is_empty() {
            c.to_string()
        } else {
            folded.to_string()
        };
        for c in piece.chars() {
            if c.is_ascii_alphanumeric() {
                if pending_sep && !out.is_empty() {
                    out.push('_');
                }
                pending_sep = false;
                out.push(c.to_ascii_lowercase());
            } else {
                pending_sep = true;
            }
        }
    }
    out
}
