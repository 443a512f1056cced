use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use formula_core::DialectCombo;
use formula_engine::registry::{iter_function_specs, Category};
use formula_engine::Scope;
use formula_query::{
    compile_multi_query, ColumnRegistry, CompiledFormulaInfo, CompiledMultiQuery, CompilerSettings,
    FromObject, MultiQueryTranslator, QueryError, QuerySpec, TranslatedMultiQuery,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(about = "Compile BI formula queries and translate them into SQL.")]
pub struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Subcommand)]
enum Command {
    /// List the supported SQL dialects.
    Dialects,

    /// List the functions formulas can call.
    Functions {
        /// Only functions translatable for this dialect.
        #[arg(long)]
        dialect: Option<String>,
    },

    /// Compile a query spec and split it into sub-queries.
    Compile(QueryArgs),

    /// Compile a query spec and print it as SQL.
    Translate(QueryArgs),
}

#[derive(clap::Args)]
struct QueryArgs {
    /// Query spec (JSON).
    spec: PathBuf,

    /// Data source avatars and field columns (JSON).
    #[arg(long, value_name = "PATH")]
    registry: PathBuf,

    /// Compiler settings (JSON). Missing keys take their defaults.
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Dialect to compile for. Overrides the one from `--settings`.
    #[arg(long)]
    dialect: Option<String>,

    /// Skip constant folding and the other simplifications.
    #[arg(long)]
    disable_optimizations: bool,
}

#[derive(Debug, Serialize)]
struct JsonFunction {
    name: &'static str,
    category: Category,
    is_window: bool,
    dialects: DialectCombo,
}

#[derive(Debug, Serialize)]
struct JsonError {
    code: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct JsonTranslation<'a> {
    sql: &'a str,
    queries: &'a TranslatedMultiQuery,
}

pub fn run() -> Result<()> {
    let args = Args::parse();
    run_with_args(args)
}

pub fn run_with_args(args: Args) -> Result<()> {
    match &args.command {
        Command::Dialects => dialects(&args.format),
        Command::Functions { dialect } => functions(&args.format, dialect.as_deref()),
        Command::Compile(query_args) => {
            let (spec, registry, settings) = load_query(query_args)?;
            match compile_multi_query(&spec, &registry, &settings) {
                Ok(multi_query) => print_compiled(&args.format, &multi_query),
                Err(err) => report_query_error(&args.format, err),
            }
        }
        Command::Translate(query_args) => {
            let (spec, registry, settings) = load_query(query_args)?;
            let translated = compile_multi_query(&spec, &registry, &settings).and_then(|multi_query| {
                MultiQueryTranslator::new(&registry, settings.dialect).translate(&multi_query)
            });
            match translated {
                Ok(translated) => print_translated(&args.format, &translated),
                Err(err) => report_query_error(&args.format, err),
            }
        }
    }
}

fn parse_dialect(input: &str) -> Result<DialectCombo> {
    input
        .parse()
        .with_context(|| format!("unknown dialect '{input}' (see `dialects`)"))
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read {what} {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse {what} {}", path.display()))
}

fn load_query(args: &QueryArgs) -> Result<(QuerySpec, ColumnRegistry, CompilerSettings)> {
    let spec: QuerySpec = read_json(&args.spec, "query spec")?;
    let registry: ColumnRegistry = read_json(&args.registry, "registry")?;
    let mut settings: CompilerSettings = match &args.settings {
        Some(path) => read_json(path, "settings")?,
        None => CompilerSettings::default(),
    };
    if let Some(dialect) = &args.dialect {
        settings.dialect = parse_dialect(dialect)?;
    }
    if args.disable_optimizations {
        settings.disable_optimizations = true;
    }
    log::debug!("compiling {} for {}", args.spec.display(), settings.dialect);
    Ok((spec, registry, settings))
}

/// Write to stdout; a closed pipe (e.g. `| head`) is not an error.
fn write_stdout(output: &str) -> Result<()> {
    let mut handle = io::stdout().lock();
    match handle.write_all(output.as_bytes()).and_then(|()| handle.flush()) {
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => Ok(other?),
    }
}

fn write_json<T: Serialize>(value: &T) -> Result<()> {
    let mut output = serde_json::to_string(value)?;
    output.push('\n');
    write_stdout(&output)
}

fn dialects(format: &OutputFormat) -> Result<()> {
    let names: Vec<String> = DialectCombo::ANY
        .iter_single()
        .map(|dialect| dialect.to_string())
        .collect();
    match format {
        OutputFormat::Text => {
            let mut output = names.join("\n");
            output.push('\n');
            write_stdout(&output)
        }
        OutputFormat::Json => write_json(&names),
    }
}

fn functions(format: &OutputFormat, dialect: Option<&str>) -> Result<()> {
    let dialect = dialect.map(parse_dialect).transpose()?;

    // Overloads of one name are listed once, with the union of their dialects.
    let mut listed: BTreeMap<(&'static str, bool), JsonFunction> = BTreeMap::new();
    for spec in iter_function_specs() {
        if !spec.scopes.contains(Scope::DOCUMENTED) {
            continue;
        }
        if dialect.is_some_and(|dialect| spec.select_variant(dialect).is_none()) {
            continue;
        }
        let supported = spec.supported_dialects();
        listed
            .entry((spec.name, spec.is_window))
            .and_modify(|function| function.dialects = function.dialects | supported)
            .or_insert_with(|| JsonFunction {
                name: spec.name,
                category: spec.category,
                is_window: spec.is_window,
                dialects: supported,
            });
    }
    let functions: Vec<JsonFunction> = listed.into_values().collect();

    match format {
        OutputFormat::Text => {
            let mut output = String::new();
            for function in &functions {
                let kind = if function.is_window { " (window)" } else { "" };
                let _ = writeln!(
                    output,
                    "{}{kind}\t{}\t{}",
                    function.name,
                    format!("{:?}", function.category).to_ascii_lowercase(),
                    function.dialects
                );
            }
            write_stdout(&output)
        }
        OutputFormat::Json => write_json(&functions),
    }
}

fn write_formulas(output: &mut String, title: &str, formulas: &[CompiledFormulaInfo]) {
    if formulas.is_empty() {
        return;
    }
    let _ = writeln!(output, "  {title}:");
    for info in formulas {
        match &info.alias {
            Some(alias) => {
                let _ = writeln!(output, "    {} AS {alias}", info.formula);
            }
            None => {
                let _ = writeln!(output, "    {}", info.formula);
            }
        }
    }
}

fn print_compiled(format: &OutputFormat, multi_query: &CompiledMultiQuery) -> Result<()> {
    if let OutputFormat::Json = format {
        return write_json(multi_query);
    }

    let mut output = String::new();
    for query in &multi_query.queries {
        let _ = writeln!(output, "query {}", query.id);
        for from in &query.joined_from.froms {
            match from {
                FromObject::Table { id, source, .. } => {
                    let _ = writeln!(output, "  from: {id} (table {source})");
                }
                FromObject::Subquery { id, query_id, .. } => {
                    let _ = writeln!(output, "  from: {id} (query {query_id})");
                }
            }
        }
        write_formulas(&mut output, "select", &query.select);
        write_formulas(&mut output, "group by", &query.group_by);
        write_formulas(&mut output, "filters", &query.filters);
        write_formulas(&mut output, "order by", &query.order_by);
        write_formulas(&mut output, "join on", &query.join_on);
    }
    write_stdout(&output)
}

fn print_translated(format: &OutputFormat, translated: &TranslatedMultiQuery) -> Result<()> {
    let sql = translated.to_sql()?;
    match format {
        OutputFormat::Text => write_stdout(&format!("{sql}\n")),
        OutputFormat::Json => write_json(&JsonTranslation {
            sql: &sql,
            queries: translated,
        }),
    }
}

/// Formula errors are part of the output; anything else aborts the command.
fn report_query_error(format: &OutputFormat, err: QueryError) -> Result<()> {
    if err.formula_errors().is_empty() {
        return Err(err.into());
    }
    let errors: Vec<JsonError> = err
        .formula_errors()
        .iter()
        .map(|err| JsonError {
            code: err.code().to_string(),
            message: err.to_string(),
        })
        .collect();
    match format {
        OutputFormat::Text => {
            for error in &errors {
                eprintln!("error[{}]: {}", error.code, error.message);
            }
        }
        OutputFormat::Json => write_json(&serde_json::json!({ "errors": errors }))?,
    }
    std::process::exit(1);
}
