use tracing::debug;

use crate::{
    packet::{decode, PacketView},
    rule::{Action, FilterRule},
};

/// Runs `rules` in order against `view` and returns the action of the first rule that matches,
/// or `default` if none does (or the packet could not be decoded at all).
///
/// Every match emits a debug level `nfw::classify` event with the source address, protocol and
/// action. Kept below the default `info` level so a slow log sink stays off the packet path.
pub fn classify(view: Option<&PacketView<'_>>, rules: &[FilterRule], default: Action) -> Action {
    let Some(view) = view else {
        return default;
    };

    for (index, rule) in rules.iter().enumerate() {
        if rule.matches(view) {
            let action = rule.action();
            debug!(
                target: "nfw::classify",
                src = %view.ip.src,
                protocol = %view.ip.protocol,
                %action,
                rule = index,
                "rule matched"
            );
            return action;
        }
    }

    default
}

/// An ordered list of rules with a default action. Order is priority: the first matching rule
/// wins.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<FilterRule>,
    default_action: Action,
}

impl RuleSet {
    /// Creates a rule set that accepts whatever no rule matches.
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules, default_action: Action::Accept }
    }

    /// Sets the action taken when no rule matches.
    pub fn with_default(mut self, action: Action) -> Self {
        self.default_action = action;
        self
    }

    /// Appends a rule with the lowest priority.
    pub fn push(&mut self, rule: FilterRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn default_action(&self) -> Action {
        self.default_action
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Decodes `packet` and classifies it.
    pub fn classify(&self, packet: &[u8]) -> Action {
        classify(decode(packet).as_ref(), &self.rules, self.default_action)
    }
}

impl FromIterator<FilterRule> for RuleSet {
    fn from_iter<I: IntoIterator<Item = FilterRule>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl Extend<FilterRule> for RuleSet {
    fn extend<I: IntoIterator<Item = FilterRule>>(&mut self, iter: I) {
        self.rules.extend(iter);
    }
}
