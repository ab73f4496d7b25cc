//! The formula compiler: one walk over a parse tree that infers types,
//!  resolves field references and hands literals, operators and functions to
//!  the dialect's translator.

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};

use crate::{
    ast::{ArgList, Expression as E, ExpressionId, ParseTree},
    dialect::Dialect,
    error::{Error, Result},
    functions::FormulaFunction,
    parser,
    schema::{Field, FieldKind, FormulaOptions, TableSchema},
    sql::Expression,
    state::StateView,
    support::function_supported,
    translate::{Fragment, InferredType, Mode, Settings, TranslationContext, translator},
};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CompileOptions {
    pub dialect: Dialect,
    pub mode: Mode,
    /// IANA time zone date parts are extracted in
    pub timezone: String,
    /// Alias qualifying column references in select mode
    pub alias: Option<String>,
    /// Table resolving `CreatedBy`/`LastModifiedBy` user ids
    pub user_table: String,
    /// What `NOW()` freezes to in generated columns; the current time if unset
    pub now: Option<DateTime<Utc>>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            mode: Mode::default(),
            timezone: "UTC".to_string(),
            alias: None,
            user_table: "users".to_string(),
            now: None,
        }
    }
}

impl CompileOptions {
    pub fn new(dialect: Dialect, mode: Mode) -> Self {
        Self {
            dialect,
            mode,
            ..Default::default()
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    fn settings(&self) -> Settings {
        let mut settings = Settings::new(self.mode);
        settings.timezone = self.timezone.clone();
        settings.alias = self.alias.clone();
        if let Some(now) = self.now {
            settings.now = now;
        }
        settings
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFormula {
    pub sql: String,
    /// Fields whose column or selection appears in `sql`, in order of first
    ///  reference. Formula fields are expanded, so only their leaves appear.
    pub dependencies: Vec<String>,
    pub ty: InferredType,
    pub is_array: bool,
}

/// Compiles formulas of one table. Formula expansions are cached for the
///  lifetime of the compiler, so a compiler should not outlive the state it
///  reads from.
pub struct Compiler<'a> {
    table: &'a TableSchema,
    options: CompileOptions,
    state: Option<&'a dyn StateView>,
    cx: Box<dyn TranslationContext>,
    expansions: IndexMap<String, (Fragment, Vec<String>)>,
    visiting: Vec<String>,
    dependencies: IndexSet<String>,
}

impl<'a> Compiler<'a> {
    pub fn new(table: &'a TableSchema, options: CompileOptions) -> Self {
        let cx = translator(options.dialect, options.settings());
        Self {
            table,
            options,
            state: None,
            cx,
            expansions: IndexMap::new(),
            visiting: Vec::new(),
            dependencies: IndexSet::new(),
        }
    }

    /// Reads selections and CTE names from `state`. Only select mode uses it.
    pub fn with_state(mut self, state: &'a dyn StateView) -> Self {
        self.state = Some(state);
        self
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn compile(&mut self, tree: &ParseTree) -> Result<CompiledFormula> {
        self.dependencies.clear();
        let fragment = self.root(tree)?;
        Ok(self.finish(fragment))
    }

    /// Compiles the value of one field, expanding it when it is a formula.
    pub fn compile_field(&mut self, field_id: &str) -> Result<CompiledFormula> {
        self.dependencies.clear();
        let fragment = self.field(field_id)?;
        Ok(self.finish(fragment))
    }

    fn finish(&self, fragment: Fragment) -> CompiledFormula {
        CompiledFormula {
            sql: fragment.expr.to_string(),
            dependencies: self.dependencies.iter().cloned().collect(),
            ty: fragment.ty,
            is_array: fragment.is_array,
        }
    }

    fn root(&mut self, tree: &ParseTree) -> Result<Fragment> {
        let root = tree.root().ok_or(parser::Error::NoExpression)?;
        self.walk(tree, root)
    }

    fn walk(&mut self, tree: &ParseTree, id: ExpressionId) -> Result<Fragment> {
        let expr = tree
            .get_expr(id)
            .ok_or_else(|| Error::Other(format!("Dangling expression id {id:?}")))?;
        match expr {
            E::BoolLiteral(v) => Ok(Fragment::new(Expression::BoolLiteral(*v), InferredType::Boolean)),
            E::NumberLiteral(v) => Ok(Fragment::new(
                Expression::NumberLiteral(v.clone()),
                InferredType::Number,
            )),
            E::StringLiteral(v) => Ok(Fragment::new(self.cx.string_literal(v), InferredType::String)),
            E::NullLiteral => Ok(Fragment::new(Expression::Null, InferredType::Unknown)),
            E::Field(field_id) => self.field(field_id),
            E::UnaryOperator(op, child) => {
                let value = self.walk(tree, *child)?;
                self.cx.translate_unary_op(*op, value)
            }
            E::BinaryOperator(l, op, r) => {
                let l = self.walk(tree, *l)?;
                let r = self.walk(tree, *r)?;
                self.cx.translate_binary_op(l, *op, r)
            }
            E::Sequence(args, op) => {
                let mut operands = tree.get_args(args).iter();
                let first = operands
                    .next()
                    .ok_or_else(|| Error::UnsupportedOperator(op.symbol().to_string()))?;
                let mut acc = self.walk(tree, *first)?;
                for next in operands {
                    let next = self.walk(tree, *next)?;
                    acc = self.cx.translate_binary_op(acc, *op, next)?;
                }
                Ok(acc)
            }
            E::FunctionCall { name, args } => self.call(tree, name, args),
        }
    }

    fn call(&mut self, tree: &ParseTree, func: &FormulaFunction, args: &ArgList) -> Result<Fragment> {
        if let FormulaFunction::Unknown(name) = func {
            return Err(Error::UnsupportedFunction(name.clone()));
        }
        let ids = tree.get_args(args);
        if !func.accepts(ids.len()) {
            return Err(Error::IncorrectArgCount(func.name().to_string(), ids.len()));
        }
        if !function_supported(self.options.dialect, self.options.mode, func) {
            return Err(Error::UnsupportedFunction(func.name().to_string()));
        }
        let args = ids
            .iter()
            .map(|arg| self.walk(tree, *arg))
            .collect::<Result<Vec<_>>>()?;
        self.cx.translate_fn_call(func, &args)
    }

    /// Resolves a field reference: formulas are expanded in place, otherwise
    ///  a selection registered in the state wins over the CTE column, which
    ///  wins over the physical column.
    fn field(&mut self, field_id: &str) -> Result<Fragment> {
        let table = self.table;
        let field = table
            .field(field_id)
            .ok_or_else(|| Error::FieldNotFound(field_id.to_string()))?;
        if let FieldKind::Formula(options) = &field.kind {
            return self.expand(field, options);
        }

        let state = match self.options.mode {
            Mode::Select => self.state,
            Mode::Generated => None,
        };
        let provider = self.cx.provider();
        let expr = if let Some(selection) = state.and_then(|s| s.selection(&field.id)) {
            Expression::Raw(selection.to_string())
        } else if let Some(cte) = state.and_then(|s| s.cte_name(&field.id)) {
            Expression::column(Some(cte), &field.column)
        } else {
            match &field.kind {
                FieldKind::System(system) if system.is_user() => Expression::Raw(provider.user_lookup(
                    &self.cx.column(&field.column).to_string(),
                    &self.options.user_table,
                )),
                _ => self.cx.column(&field.column),
            }
        };
        self.dependencies.insert(field.id.clone());
        Ok(self.typed(field, expr))
    }

    fn typed(&self, field: &Field, expr: Expression) -> Fragment {
        let provider = self.cx.provider();
        match &field.kind {
            // Links and users read as their title text
            FieldKind::Link(_) => Fragment::new(
                Expression::Raw(provider.link_title(&expr.to_string(), field.is_multi_valued)),
                InferredType::String,
            ),
            FieldKind::System(system) if system.is_user() => Fragment::new(
                Expression::Raw(provider.link_title(&expr.to_string(), false)),
                InferredType::String,
            ),
            _ if field.is_multi_valued => Fragment::array(expr, InferredType::String),
            _ => Fragment::new(expr, field.value_kind.into()),
        }
    }

    fn expand(&mut self, field: &Field, options: &FormulaOptions) -> Result<Fragment> {
        if let Some((fragment, deps)) = self.expansions.get(&field.id) {
            self.dependencies.extend(deps.iter().cloned());
            return Ok(fragment.clone());
        }
        if let Some(start) = self.visiting.iter().position(|v| *v == field.id) {
            let mut cycle = self.visiting[start..].to_vec();
            cycle.push(field.id.clone());
            return Err(Error::CircularReference(cycle));
        }

        let parsed;
        let tree = match &options.tree {
            Some(tree) => tree,
            None => {
                parsed = parser::parse(&options.expression)?;
                &parsed
            }
        };
        log::trace!("expanding formula {} = {}", field.id, options.expression);

        self.visiting.push(field.id.clone());
        let outer = std::mem::take(&mut self.dependencies);
        let result = self.root(tree);
        self.visiting.pop();
        let inner = std::mem::replace(&mut self.dependencies, outer);

        let mut fragment = result?;
        if fragment.ty == InferredType::Unknown {
            fragment.ty = field.value_kind.into();
        }
        self.dependencies.extend(inner.iter().cloned());
        self.expansions
            .insert(field.id.clone(), (fragment.clone(), inner.into_iter().collect()));
        Ok(fragment)
    }
}

/// Compiles `tree` against `table` with a fresh compiler.
pub fn compile(tree: &ParseTree, table: &TableSchema, options: CompileOptions) -> Result<CompiledFormula> {
    Compiler::new(table, options).compile(tree)
}
