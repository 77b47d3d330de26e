//! JSGF grammar parsing and compilation into finite-state grammars. The
//! parser handles rule definitions with alternation (weighted), sequences,
//! grouping, optionals, Kleene star/plus, rule references and imports.
//! Star, plus and optionals are rewritten into generated right-recursive
//! sub-rules at parse time, so compilation is a single recursive state
//! expansion. Only right-recursion of rule references is allowed; anything
//! else cannot be expressed by a finite-state machine and is rejected.
use crate::error::{Result, SttError};
use crate::fsg::model::FsgModel;
use crate::logmath::LogMath;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const NULL_RULE: &str = "<NULL>";
pub const VOID_RULE: &str = "<VOID>";

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    RuleName(String),
    Weight(f32),
    Sym(char),
}

#[derive(Debug, Clone)]
pub struct JsgfAtom {
    name: String,
    weight: f32,
}

impl JsgfAtom {
    fn new(name: &str, weight: f32) -> Self {
        Self {
            name: name.to_string(),
            weight,
        }
    }

    fn is_rule(&self) -> bool {
        self.name.starts_with('<')
    }
}

#[derive(Debug, Clone, Default)]
pub struct JsgfRhs {
    /// Alternatives; each is a sequence of atoms. The weight of an
    /// alternative rides on its first atom.
    alts: Vec<Vec<JsgfAtom>>,
}

#[derive(Debug, Clone)]
pub struct JsgfRule {
    name: String,
    public: bool,
    rhs: JsgfRhs,
}

impl JsgfRule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_public(&self) -> bool {
        self.public
    }
}

#[derive(Debug, Default)]
pub struct JsgfGrammar {
    name: String,
    /// Fully qualified rule name (`<grammar.rule>`) to definition. Imported
    /// grammars share this namespace.
    rules: HashMap<String, JsgfRule>,
    search_path: Vec<PathBuf>,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
        }
    }

    fn tokens(mut self) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        while let Some(&c) = self.chars.peek() {
            match c {
                '#' => {
                    // The self-identifying header line.
                    for c in self.chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                c if c.is_whitespace() => {
                    self.chars.next();
                }
                '/' => {
                    self.chars.next();
                    match self.chars.peek() {
                        Some('/') => {
                            for c in self.chars.by_ref() {
                                if c == '\n' {
                                    break;
                                }
                            }
                        }
                        Some('*') => {
                            self.chars.next();
                            let mut prev = ' ';
                            for c in self.chars.by_ref() {
                                if prev == '*' && c == '/' {
                                    break;
                                }
                                prev = c;
                            }
                        }
                        _ => {
                            let mut num = String::new();
                            while let Some(&c) = self.chars.peek() {
                                if c == '/' {
                                    self.chars.next();
                                    break;
                                }
                                num.push(c);
                                self.chars.next();
                            }
                            let w: f32 = num.trim().parse().map_err(|_| {
                                SttError::bad_format("jsgf", format!("bad weight /{}/", num))
                            })?;
                            out.push(Token::Weight(w));
                        }
                    }
                }
                '<' => {
                    let mut name = String::from('<');
                    self.chars.next();
                    for c in self.chars.by_ref() {
                        name.push(c);
                        if c == '>' {
                            break;
                        }
                    }
                    if !name.ends_with('>') {
                        return Err(SttError::bad_format("jsgf", "unterminated rule name"));
                    }
                    out.push(Token::RuleName(name));
                }
                '=' | ';' | '|' | '(' | ')' | '[' | ']' | '*' | '+' => {
                    out.push(Token::Sym(c));
                    self.chars.next();
                }
                _ => {
                    let mut word = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if c.is_whitespace() || "=;|()[]*+<>/".contains(c) {
                            break;
                        }
                        word.push(c);
                        self.chars.next();
                    }
                    out.push(Token::Word(word));
                }
            }
        }
        Ok(out)
    }
}

struct Parser<'g> {
    grammar: &'g mut JsgfGrammar,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'g> Parser<'g> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token> {
        let t = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| SttError::bad_format("jsgf", "unexpected end of grammar"))?;
        self.pos += 1;
        Ok(t)
    }

    fn expect_sym(&mut self, sym: char) -> Result<()> {
        match self.next()? {
            Token::Sym(c) if c == sym => Ok(()),
            other => Err(SttError::bad_format(
                "jsgf",
                format!("expected '{}', found {:?}", sym, other),
            )),
        }
    }

    fn expect_word(&mut self, word: &str) -> Result<()> {
        match self.next()? {
            Token::Word(w) if w == word => Ok(()),
            other => Err(SttError::bad_format(
                "jsgf",
                format!("expected '{}', found {:?}", word, other),
            )),
        }
    }

    fn parse(&mut self) -> Result<()> {
        self.expect_word("grammar")?;
        let name = match self.next()? {
            Token::Word(w) => w,
            other => {
                return Err(SttError::bad_format(
                    "jsgf",
                    format!("expected grammar name, found {:?}", other),
                ))
            }
        };
        self.expect_sym(';')?;
        self.grammar.name = name;

        while let Some(tok) = self.peek().cloned() {
            match tok {
                Token::Word(w) if w == "import" => {
                    self.pos += 1;
                    let imported = match self.next()? {
                        Token::RuleName(name) => name,
                        other => {
                            return Err(SttError::bad_format(
                                "jsgf",
                                format!("expected import name, found {:?}", other),
                            ))
                        }
                    };
                    self.expect_sym(';')?;
                    self.grammar.import(&imported)?;
                }
                _ => self.parse_rule()?,
            }
        }
        Ok(())
    }

    fn parse_rule(&mut self) -> Result<()> {
        let mut public = false;
        if let Some(Token::Word(w)) = self.peek() {
            if w == "public" {
                public = true;
                self.pos += 1;
            }
        }
        let name = match self.next()? {
            Token::RuleName(name) => name,
            other => {
                return Err(SttError::bad_format(
                    "jsgf",
                    format!("expected rule name, found {:?}", other),
                ))
            }
        };
        self.expect_sym('=')?;
        let rhs = self.parse_rhs()?;
        self.expect_sym(';')?;
        let grammar_name = self.grammar.name.clone();
        self.grammar
            .define_rule(&grammar_name, Some(&name), rhs, public);
        Ok(())
    }

    fn parse_rhs(&mut self) -> Result<JsgfRhs> {
        let mut alts = Vec::new();
        loop {
            alts.push(self.parse_sequence()?);
            match self.peek() {
                Some(Token::Sym('|')) => {
                    self.pos += 1;
                }
                _ => break,
            }
        }
        Ok(JsgfRhs { alts })
    }

    fn parse_sequence(&mut self) -> Result<Vec<JsgfAtom>> {
        let mut weight = 1.0f32;
        if let Some(Token::Weight(w)) = self.peek() {
            weight = *w;
            self.pos += 1;
        }
        let mut atoms = Vec::new();
        loop {
            let atom = match self.peek().cloned() {
                Some(Token::Word(w)) => {
                    self.pos += 1;
                    JsgfAtom::new(&w, 1.0)
                }
                Some(Token::RuleName(name)) => {
                    self.pos += 1;
                    JsgfAtom::new(&name, 1.0)
                }
                Some(Token::Sym('(')) => {
                    self.pos += 1;
                    let inner = self.parse_rhs()?;
                    self.expect_sym(')')?;
                    let grammar_name = self.grammar.name.clone();
                    let rule = self.grammar.define_rule(&grammar_name, None, inner, false);
                    JsgfAtom::new(&rule, 1.0)
                }
                Some(Token::Sym('[')) => {
                    self.pos += 1;
                    let inner = self.parse_rhs()?;
                    self.expect_sym(']')?;
                    let rule = self.grammar.optional_rule(inner);
                    JsgfAtom::new(&rule, 1.0)
                }
                _ => break,
            };
            // Kleene closure rewrites into a fresh right-recursive rule.
            let atom = match self.peek() {
                Some(Token::Sym('*')) => {
                    self.pos += 1;
                    let rule = self.grammar.kleene_rule(atom, false);
                    JsgfAtom::new(&rule, 1.0)
                }
                Some(Token::Sym('+')) => {
                    self.pos += 1;
                    let rule = self.grammar.kleene_rule(atom, true);
                    JsgfAtom::new(&rule, 1.0)
                }
                _ => atom,
            };
            atoms.push(atom);
        }
        if atoms.is_empty() {
            return Err(SttError::bad_format("jsgf", "empty alternative"));
        }
        atoms[0].weight = weight;
        Ok(atoms)
    }
}

impl JsgfGrammar {
    pub fn parse_string(text: &str, search_path: Vec<PathBuf>) -> Result<Self> {
        let mut grammar = JsgfGrammar {
            search_path,
            ..Default::default()
        };
        grammar.parse_into(text)?;
        Ok(grammar)
    }

    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let search_path = path
            .parent()
            .map(|p| vec![p.to_path_buf()])
            .unwrap_or_default();
        Self::parse_string(&text, search_path)
    }

    fn parse_into(&mut self, text: &str) -> Result<()> {
        let tokens = Lexer::new(text).tokens()?;
        let mut parser = Parser {
            grammar: self,
            tokens,
            pos: 0,
        };
        parser.parse()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> impl Iterator<Item = &JsgfRule> {
        self.rules.values()
    }

    /// Fully qualified name of a rule in grammar `grammar_name`.
    fn fullname(grammar_name: &str, name: &str) -> String {
        // Already qualified names pass through.
        if name[1..].contains('.') {
            name.to_string()
        } else {
            format!("<{}.{}", grammar_name, &name[1..])
        }
    }

    /// Define a rule; generated (unnamed) rules get a `gNNNNN` name.
    fn define_rule(
        &mut self,
        grammar_name: &str,
        name: Option<&str>,
        rhs: JsgfRhs,
        public: bool,
    ) -> String {
        let fullname = match name {
            Some(n) => Self::fullname(grammar_name, n),
            None => format!("<{}.g{:05}>", grammar_name, self.rules.len()),
        };
        debug!("Defined rule: {}{}", if public { "PUBLIC " } else { "" }, fullname);
        if self
            .rules
            .insert(
                fullname.clone(),
                JsgfRule {
                    name: fullname.clone(),
                    public,
                    rhs,
                },
            )
            .is_some()
        {
            warn!("Multiply defined symbol: {}", fullname);
        }
        fullname
    }

    /// `[x]` becomes `(<NULL> | x)`.
    fn optional_rule(&mut self, mut rhs: JsgfRhs) -> String {
        let mut alts = vec![vec![JsgfAtom::new(NULL_RULE, 1.0)]];
        alts.append(&mut rhs.alts);
        let grammar_name = self.name.clone();
        self.define_rule(&grammar_name, None, JsgfRhs { alts }, false)
    }

    /// `x*` becomes `<g> = <NULL> | x <g>;` and `x+` becomes
    /// `<g> = x | x <g>;`.
    fn kleene_rule(&mut self, atom: JsgfAtom, plus: bool) -> String {
        let grammar_name = self.name.clone();
        let first = if plus {
            vec![JsgfAtom::new(&atom.name, 1.0)]
        } else {
            vec![JsgfAtom::new(NULL_RULE, 1.0)]
        };
        let name = self.define_rule(&grammar_name, None, JsgfRhs::default(), false);
        let second = vec![atom, JsgfAtom::new(&name, 1.0)];
        self.rules.get_mut(&name).unwrap().rhs = JsgfRhs {
            alts: vec![first, second],
        };
        name
    }

    /// Resolve and parse an `import <package.rule>` / `<package.*>`
    /// declaration into the shared namespace.
    fn import(&mut self, imported: &str) -> Result<()> {
        let inner = imported.trim_start_matches('<').trim_end_matches('>');
        let package = match inner.rsplit_once('.') {
            Some((package, _rule)) => package,
            None => inner,
        };
        let mut candidates = vec![format!("{}.gram", package)];
        candidates.push(format!("{}.gram", package.replace('.', "/")));
        for dir in self.search_path.clone() {
            for cand in &candidates {
                let path = dir.join(cand);
                if path.is_file() {
                    info!("Importing {} from {}", imported, path.display());
                    let text = fs::read_to_string(&path)?;
                    let saved_name = std::mem::take(&mut self.name);
                    self.parse_into(&text)?;
                    self.name = saved_name;
                    return Ok(());
                }
            }
        }
        Err(SttError::bad_format(
            "jsgf",
            format!("failed to resolve import {}", imported),
        ))
    }

    pub fn get_rule(&self, name: &str) -> Option<&JsgfRule> {
        let bracketed = if name.starts_with('<') {
            name.to_string()
        } else {
            format!("<{}>", name)
        };
        self.rules
            .get(&Self::fullname(&self.name, &bracketed))
            .or_else(|| self.rules.get(&bracketed))
    }

    /// The first public rule belonging to this grammar.
    pub fn public_rule(&self) -> Option<&JsgfRule> {
        let prefix = format!("<{}.", self.name);
        let mut names: Vec<&String> = self
            .rules
            .iter()
            .filter(|(k, r)| r.public && k.starts_with(&prefix))
            .map(|(k, _)| k)
            .collect();
        names.sort();
        names.first().map(|k| &self.rules[*k])
    }

    /// Find a rule definition for an atom referenced from `within`.
    fn resolve(&self, within: &str, name: &str) -> Option<&JsgfRule> {
        let grammar_of_rule = within
            .trim_start_matches('<')
            .split('.')
            .next()
            .unwrap_or(&self.name);
        let qualified = Self::fullname(grammar_of_rule, name);
        if let Some(r) = self.rules.get(&qualified) {
            return Some(r);
        }
        // Unqualified references to imported rules match by suffix.
        let suffix = format!(".{}", &name[1..]);
        self.rules.values().find(|r| r.name.ends_with(&suffix))
    }

    pub fn build_fsg(
        &self,
        rule: &JsgfRule,
        lmath: Arc<LogMath>,
        lw: f32,
    ) -> Result<FsgModel> {
        self.build_fsg_internal(rule, lmath, lw, true)
    }

    pub fn build_fsg_raw(
        &self,
        rule: &JsgfRule,
        lmath: Arc<LogMath>,
        lw: f32,
    ) -> Result<FsgModel> {
        self.build_fsg_internal(rule, lmath, lw, false)
    }

    fn build_fsg_internal(
        &self,
        rule: &JsgfRule,
        lmath: Arc<LogMath>,
        lw: f32,
        do_closure: bool,
    ) -> Result<FsgModel> {
        let mut expander = Expander {
            grammar: self,
            nstate: 0,
            links: Vec::new(),
            rulestack: Vec::new(),
        };
        let entry = expander.expand_rule(rule)?;

        let mut fsg = FsgModel::new(rule.name(), lmath.clone(), lw, expander.nstate as usize);
        fsg.start_state = entry.0;
        fsg.final_state = entry.1;
        for link in &expander.links {
            match &link.atom {
                Some(atom) if !atom.is_rule() => {
                    let wid = fsg.word_add(&atom.name);
                    let logp = (lmath.log(atom.weight as f64) as f32 * lw) as i32;
                    fsg.trans_add(link.from, link.to, logp, wid);
                }
                Some(atom) => {
                    fsg.null_trans_add(link.from, link.to, lmath.log(atom.weight as f64));
                }
                None => {
                    fsg.null_trans_add(link.from, link.to, 0);
                }
            }
        }
        if do_closure {
            fsg.null_trans_closure();
        }
        Ok(fsg)
    }
}

struct JsgfLink {
    from: i32,
    to: i32,
    atom: Option<JsgfAtom>,
}

/// Expansion result for one alternative: either the last state of the chain
/// or a marker that the alternative closed a right-recursive loop.
enum RhsEnd {
    Last(i32),
    Recursion,
}

struct Expander<'g> {
    grammar: &'g JsgfGrammar,
    nstate: i32,
    links: Vec<JsgfLink>,
    /// Rules currently being expanded, with their entry states.
    rulestack: Vec<(String, i32)>,
}

impl<'g> Expander<'g> {
    fn add_link(&mut self, atom: Option<JsgfAtom>, from: i32, to: i32) {
        self.links.push(JsgfLink { from, to, atom });
    }

    /// Expand a rule to a fresh (entry, exit) state pair.
    fn expand_rule(&mut self, rule: &JsgfRule) -> Result<(i32, i32)> {
        let entry = self.nstate;
        let exit = self.nstate + 1;
        self.nstate += 2;
        self.rulestack.push((rule.name.clone(), entry));

        // Mass of a choice point is normalized to one; an all-zero
        // alternation list falls back to uniform.
        let mut norm: f32 = rule
            .rhs
            .alts
            .iter()
            .filter_map(|alt| alt.first().map(|a| a.weight))
            .sum();
        if norm == 0.0 {
            debug!("Zero weight sum in {}, using uniform weights", rule.name);
            norm = 1.0;
        }

        for alt in &rule.rhs.alts {
            match self.expand_rhs(rule, alt, norm, entry)? {
                RhsEnd::Recursion => {}
                RhsEnd::Last(lastnode) => self.add_link(None, lastnode, exit),
            }
        }
        self.rulestack.pop();
        Ok((entry, exit))
    }

    fn expand_rhs(
        &mut self,
        rule: &JsgfRule,
        atoms: &[JsgfAtom],
        norm: f32,
        entry: i32,
    ) -> Result<RhsEnd> {
        let mut lastnode = entry;
        for (i, atom) in atoms.iter().enumerate() {
            let weight = if i == 0 { atom.weight / norm } else { atom.weight };
            let weighted = JsgfAtom::new(&atom.name, weight);
            if atom.is_rule() {
                if atom.name == NULL_RULE {
                    let to = self.nstate;
                    self.nstate += 1;
                    self.add_link(Some(weighted), lastnode, to);
                    lastnode = to;
                    continue;
                }
                if atom.name == VOID_RULE {
                    return Err(SttError::bad_format(
                        "jsgf",
                        format!("<VOID> makes rule {} unspeakable", rule.name),
                    ));
                }
                let subrule = self.grammar.resolve(&rule.name, &atom.name).ok_or_else(|| {
                    SttError::bad_format(
                        "jsgf",
                        format!("Undefined rule in RHS: {}", atom.name),
                    )
                })?;
                if let Some((_, sub_entry)) = self
                    .rulestack
                    .iter()
                    .find(|(n, _)| *n == subrule.name)
                    .cloned()
                {
                    // A reference back into a rule being expanded is only
                    // expressible as a loop if nothing follows it.
                    if i + 1 != atoms.len() {
                        return Err(SttError::bad_format(
                            "jsgf",
                            format!("Only right-recursion is permitted (in {})", rule.name),
                        ));
                    }
                    debug!("Right recursion {} {} => {}", atom.name, lastnode, sub_entry);
                    self.add_link(Some(weighted), lastnode, sub_entry);
                    return Ok(RhsEnd::Recursion);
                }
                let (sub_entry, sub_exit) = self.expand_rule(subrule)?;
                self.add_link(Some(weighted), lastnode, sub_entry);
                lastnode = sub_exit;
            } else {
                let to = self.nstate;
                self.nstate += 1;
                self.add_link(Some(weighted), lastnode, to);
                lastnode = to;
            }
        }
        Ok(RhsEnd::Last(lastnode))
    }
}

/// Convenience wrapper: parse a JSGF file and compile its first public rule
/// (or `toprule` when given).
pub fn read_file(
    path: impl AsRef<Path>,
    lmath: Arc<LogMath>,
    lw: f32,
    toprule: Option<&str>,
) -> Result<FsgModel> {
    let grammar = JsgfGrammar::parse_file(path)?;
    compile(&grammar, lmath, lw, toprule)
}

pub fn read_string(
    text: &str,
    lmath: Arc<LogMath>,
    lw: f32,
    toprule: Option<&str>,
) -> Result<FsgModel> {
    let grammar = JsgfGrammar::parse_string(text, Vec::new())?;
    compile(&grammar, lmath, lw, toprule)
}

fn compile(
    grammar: &JsgfGrammar,
    lmath: Arc<LogMath>,
    lw: f32,
    toprule: Option<&str>,
) -> Result<FsgModel> {
    let rule = match toprule {
        Some(name) => grammar
            .get_rule(name)
            .ok_or_else(|| SttError::UnknownSymbol(format!("rule {} not in grammar", name)))?,
        None => grammar
            .public_rule()
            .ok_or_else(|| SttError::bad_format("jsgf", "no public rules found"))?,
    };
    info!("Compiling rule {}", rule.name());
    grammar.build_fsg(rule, lmath, lw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOFORWARD: &str = "\
#JSGF V1.0;
grammar goforward;
public <move> = go forward ten meters;
";

    const KLEENE: &str = "\
#JSGF V1.0;
// how politely can you ask
grammar test;
public <command> = <polite>* don't crash;
<polite> = please | kindly | oh mighty computer;
";

    const RIGHT_RECURSION: &str = "\
#JSGF V1.0;
grammar cmd;
public <commands> = <command> | <command> and <commands>;
<command> = stop | start;
";

    fn fsg(text: &str) -> FsgModel {
        read_string(text, LogMath::shared_default(), 7.5, None).unwrap()
    }

    #[test]
    fn simple_chain() {
        let fsg = fsg(GOFORWARD);
        assert!(fsg.accept("go forward ten meters"));
        assert!(!fsg.accept("go forward ten"));
        assert!(!fsg.accept("go forward yourself"));
        assert!(!fsg.accept(""));
    }

    #[test]
    fn kleene_star() {
        let fsg = fsg(KLEENE);
        assert!(fsg.accept("please oh mighty computer kindly don't crash"));
        assert!(fsg.accept("please please please don't crash"));
        assert!(fsg.accept("please don't crash"));
        assert!(fsg.accept("kindly don't crash"));
        assert!(fsg.accept("oh mighty computer don't crash"));
        assert!(fsg.accept("don't crash"));
        assert!(!fsg.accept("kindly oh mighty computer"));
        assert!(!fsg.accept(""));
    }

    #[test]
    fn plus_requires_one() {
        let fsg = fsg("grammar t;\npublic <r> = go+ stop;\n");
        assert!(fsg.accept("go stop"));
        assert!(fsg.accept("go go go stop"));
        assert!(!fsg.accept("stop"));
    }

    #[test]
    fn optional_brackets() {
        let fsg = fsg("grammar t;\npublic <r> = [very] nice;\n");
        assert!(fsg.accept("nice"));
        assert!(fsg.accept("very nice"));
        assert!(!fsg.accept("very"));
    }

    #[test]
    fn right_recursion_allowed() {
        let fsg = fsg(RIGHT_RECURSION);
        assert!(fsg.accept("stop"));
        assert!(fsg.accept("start"));
        assert!(fsg.accept("stop and start"));
        assert!(fsg.accept("start and start and start"));
        assert!(!fsg.accept("stop stop"));
        assert!(!fsg.accept("and stop"));
        assert!(!fsg.accept("stop and"));
        assert!(!fsg.accept(""));
    }

    #[test]
    fn left_recursion_rejected() {
        let err = read_string(
            "grammar t;\npublic <s> = <s> foo | bar;\n",
            LogMath::shared_default(),
            1.0,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Only right-recursion is permitted"));
    }

    #[test]
    fn mid_recursion_rejected() {
        let err = read_string(
            "grammar t;\npublic <s> = foo <s> bar | baz;\n",
            LogMath::shared_default(),
            1.0,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Only right-recursion is permitted"));
    }

    #[test]
    fn weights_parse_and_zero_sum_falls_back() {
        let fsg1 = fsg("grammar t;\npublic <r> = /0.8/ yes | /0.2/ no;\n");
        assert!(fsg1.accept("yes"));
        assert!(fsg1.accept("no"));
        // All-zero weights normalize by one instead of dividing by zero.
        let fsg2 = fsg("grammar t;\npublic <r> = /0.0/ yes | /0.0/ no;\n");
        assert!(fsg2.accept("yes"));
    }

    #[test]
    fn toprule_override() {
        let grammar = JsgfGrammar::parse_string(RIGHT_RECURSION, Vec::new()).unwrap();
        let rule = grammar.get_rule("cmd.command").unwrap();
        let fsg = grammar
            .build_fsg(rule, LogMath::shared_default(), 1.0)
            .unwrap();
        assert!(fsg.accept("stop"));
        assert!(!fsg.accept("stop and start"));
    }

    #[test]
    fn comments_are_ignored() {
        let fsg = fsg("grammar t;\n/* block\ncomment */\npublic <r> = hi; // eol\n");
        assert!(fsg.accept("hi"));
    }

    #[test]
    fn undefined_rule_is_an_error() {
        let err = read_string(
            "grammar t;\npublic <s> = <missing>;\n",
            LogMath::shared_default(),
            1.0,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Undefined rule"));
    }
}
