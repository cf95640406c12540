//! Global title translation
//!
//! Longest-prefix rules over the global title digits. A rule yields a
//! complete replacement called-party address: point code, optional new
//! subsystem and optionally rewritten digits.

use super::address::{GlobalTitle, SccpAddress};
use crate::errors::SccpError;
use crate::types::PointCode;
use std::sync::RwLock;
use tracing::debug;

/// One translation rule
#[derive(Debug, Clone)]
pub struct GttRule {
    /// Digit prefix this rule matches
    pub prefix: String,
    /// Restrict to one translation type, any when `None`
    pub translation_type: Option<u8>,
    /// Destination point code the translated address routes on
    pub point_code: PointCode,
    /// Replacement subsystem, keeps the original when `None`
    pub ssn: Option<u8>,
    /// Replacement for the matched prefix, keeps digits when `None`
    pub rewrite: Option<String>,
}

/// Global title translator
pub struct GlobalTitleTranslator {
    rules: RwLock<Vec<GttRule>>,
    default_pc: RwLock<Option<PointCode>>,
}

impl GlobalTitleTranslator {
    pub fn new() -> Self {
        Self { rules: RwLock::new(Vec::new()), default_pc: RwLock::new(None) }
    }

    pub fn add_rule(&self, rule: GttRule) {
        self.rules.write().unwrap().push(rule);
    }

    pub fn set_default(&self, pc: PointCode) {
        *self.default_pc.write().unwrap() = Some(pc);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().unwrap().len()
    }

    /// Translate a called address. Returns the replacement address,
    /// routable on its point code.
    pub fn translate(&self, address: &SccpAddress) -> Result<SccpAddress, SccpError> {
        // An address already routable needs no translation
        if let Some(pc) = address.point_code {
            let mut out = address.clone();
            out.point_code = Some(pc);
            return Ok(out);
        }
        let Some(gt) = &address.global_title else {
            return Err(SccpError::NoTranslationForNature);
        };
        let digits = gt.digits();
        let tt = match gt {
            GlobalTitle::TranslationOnly { translation_type, .. }
            | GlobalTitle::PlanAndType { translation_type, .. }
            | GlobalTitle::Full { translation_type, .. } => Some(*translation_type),
            GlobalTitle::NatureOnly { .. } => None,
        };

        let rules = self.rules.read().unwrap();
        let best = rules
            .iter()
            .filter(|r| digits.starts_with(&r.prefix))
            .filter(|r| match (r.translation_type, tt) {
                (Some(want), Some(have)) => want == have,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .max_by_key(|r| r.prefix.len());

        let Some(rule) = best else {
            drop(rules);
            let default = *self.default_pc.read().unwrap();
            return match default {
                Some(pc) => {
                    let mut out = address.clone();
                    out.point_code = Some(pc);
                    out.indicator.pc_present = true;
                    Ok(out)
                }
                None => Err(SccpError::NoTranslation),
            };
        };

        let mut out = address.clone();
        out.point_code = Some(rule.point_code);
        out.indicator.pc_present = true;
        out.indicator.route_on_ssn = rule.ssn.is_some() || out.ssn.is_some();
        if let Some(ssn) = rule.ssn {
            out.ssn = Some(ssn);
            out.indicator.ssn_present = true;
        }
        if let Some(rewrite) = &rule.rewrite {
            let tail = &digits[rule.prefix.len()..];
            let new_digits = format!("{rewrite}{tail}");
            out.global_title = Some(match gt.clone() {
                GlobalTitle::NatureOnly { nature, .. } => {
                    GlobalTitle::NatureOnly { nature, digits: new_digits }
                }
                GlobalTitle::TranslationOnly { translation_type, .. } => {
                    GlobalTitle::TranslationOnly { translation_type, digits: new_digits }
                }
                GlobalTitle::PlanAndType { translation_type, plan, .. } => {
                    GlobalTitle::PlanAndType { translation_type, plan, digits: new_digits }
                }
                GlobalTitle::Full { translation_type, plan, nature, .. } => {
                    GlobalTitle::Full { translation_type, plan, nature, digits: new_digits }
                }
            });
        }
        debug!(digits, pc = %rule.point_code, "global title translated");
        Ok(out)
    }
}

impl Default for GlobalTitleTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(prefix: &str, pc: PointCode) -> GttRule {
        GttRule {
            prefix: prefix.to_string(),
            translation_type: None,
            point_code: pc,
            ssn: None,
            rewrite: None,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let gtt = GlobalTitleTranslator::new();
        gtt.add_rule(rule("234", PointCode::new(1, 0, 1)));
        gtt.add_rule(rule("2348", PointCode::new(1, 0, 2)));

        let addr = SccpAddress::from_gt(GlobalTitle::e164("2348012345678"), Some(6));
        let out = gtt.translate(&addr).unwrap();
        assert_eq!(out.point_code, Some(PointCode::new(1, 0, 2)));

        let addr2 = SccpAddress::from_gt(GlobalTitle::e164("2340123456789"), Some(6));
        assert_eq!(gtt.translate(&addr2).unwrap().point_code, Some(PointCode::new(1, 0, 1)));
    }

    #[test]
    fn no_rule_and_no_default_fails() {
        let gtt = GlobalTitleTranslator::new();
        let addr = SccpAddress::from_gt(GlobalTitle::e164("15551234"), None);
        assert!(matches!(gtt.translate(&addr), Err(SccpError::NoTranslation)));
        gtt.set_default(PointCode::new(9, 9, 9));
        assert_eq!(gtt.translate(&addr).unwrap().point_code, Some(PointCode::new(9, 9, 9)));
    }

    #[test]
    fn rewrite_replaces_prefix_and_ssn() {
        let gtt = GlobalTitleTranslator::new();
        gtt.add_rule(GttRule {
            prefix: "00".to_string(),
            translation_type: None,
            point_code: PointCode::new(2, 2, 2),
            ssn: Some(8),
            rewrite: Some(String::new()),
        });
        let addr = SccpAddress::from_gt(GlobalTitle::e164("0015551234"), None);
        let out = gtt.translate(&addr).unwrap();
        assert_eq!(out.global_title.unwrap().digits(), "15551234");
        assert_eq!(out.ssn, Some(8));
    }

    #[test]
    fn translation_type_restriction() {
        let gtt = GlobalTitleTranslator::new();
        gtt.add_rule(GttRule {
            prefix: "1".to_string(),
            translation_type: Some(10),
            point_code: PointCode::new(3, 3, 3),
            ssn: None,
            rewrite: None,
        });
        // E.164 addresses carry translation type 0; the rule must not match
        let addr = SccpAddress::from_gt(GlobalTitle::e164("15551234"), None);
        assert!(gtt.translate(&addr).is_err());
    }
}
