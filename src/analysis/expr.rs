use super::Analyzer;
use crate::ast::{ExprId, ExprKind, FnId, Literal, Member};
use crate::token::{Token, TokenKind};
use crate::types::{canonical_name, DataType};

impl<'a> Analyzer<'a> {
    pub(crate) fn check_expression(
        &mut self,
        expr: ExprId,
        expected: Option<&DataType>,
    ) -> DataType {
        let kind = self.ast.expr(expr).kind.clone();
        let token = self.ast.expr(expr).token;

        let ty = match kind {
            ExprKind::Literal(literal) => match literal {
                Literal::Bool(_) => DataType::Bool,
                Literal::Int(_) => DataType::Int,
                Literal::Float(_) => DataType::Float,
                Literal::Str(_) => DataType::Str,
                Literal::Null => DataType::Null,
            },
            ExprKind::Group(inner) => self.check_expression(inner, expected),
            ExprKind::Unary { op, expr: inner } => self.check_unary(op, inner),
            ExprKind::Binary { op, left, right, .. } => self.check_binary(expr, op, left, right),
            ExprKind::Var { name, targs, .. } => self.check_var(expr, token, name, &targs),
            ExprKind::This => match self.current_class {
                Some(class) => DataType::Object(class),
                None => {
                    self.error(token, "'this' is only allowed in class methods.");
                    DataType::Void
                }
            },
            ExprKind::Assign { target, value, .. } => self.check_assignment(expr, target, value),
            ExprKind::Call { callee, args, .. } => self.check_call(expr, token, callee, &args),
            ExprKind::Cast { expr: inner, ty_expr, .. } => {
                let from = self.check_expression(inner, None);
                let to = match &ty_expr {
                    Some(ty_expr) => self.resolve_type(ty_expr),
                    None => DataType::Void,
                };
                if !cast_allowed(&from, &to) {
                    let from_name = canonical_name(&from, self.ast, self.interner);
                    let to_name = canonical_name(&to, self.ast, self.interner);
                    self.error(
                        token,
                        format!("Cannot cast from '{}' to '{}'.", from_name, to_name),
                    );
                }
                if let ExprKind::Cast { from: slot, .. } = &mut self.ast.expr_mut(expr).kind {
                    *slot = from;
                }
                to
            }
            ExprKind::Access { expr: object, name, .. } => self.check_access(expr, object, name),
            ExprKind::Index { expr: target, index, .. } => self.check_index(expr, target, index),
            ExprKind::ArrayLit { elems } => self.check_array_literal(expr, token, &elems, expected),
            ExprKind::Cond { cond, then, other } => {
                let cond_ty = self.check_expression(cond, Some(&DataType::Bool));
                if cond_ty != DataType::Bool {
                    self.error_type_mismatch(self.ast.expr(cond).token);
                }
                let then_ty = self.check_expression(then, expected);
                let other_ty = self.check_expression(other, expected);
                if then_ty != other_ty {
                    if then_ty == DataType::Int && other_ty == DataType::Float {
                        let cast = self.insert_cast(then, &DataType::Float);
                        self.replace_cond_arm(expr, true, cast);
                        DataType::Float
                    } else if then_ty == DataType::Float && other_ty == DataType::Int {
                        let cast = self.insert_cast(other, &DataType::Float);
                        self.replace_cond_arm(expr, false, cast);
                        DataType::Float
                    } else {
                        self.error_type_mismatch(token);
                        then_ty
                    }
                } else {
                    then_ty
                }
            }
            ExprKind::IsTest { expr: inner, ty_expr, .. } => {
                let from = self.check_expression(inner, None);
                if from != DataType::Any {
                    self.error_type_mismatch(token);
                }
                let target = self.resolve_type(&ty_expr);
                if let ExprKind::IsTest { target: slot, .. } = &mut self.ast.expr_mut(expr).kind {
                    *slot = target;
                }
                DataType::Bool
            }
        };

        self.ast.expr_mut(expr).ty = ty.clone();
        ty
    }

    fn replace_cond_arm(&mut self, expr: ExprId, then_arm: bool, new_arm: ExprId) {
        if let ExprKind::Cond { then, other, .. } = &mut self.ast.expr_mut(expr).kind {
            if then_arm {
                *then = new_arm;
            } else {
                *other = new_arm;
            }
        }
    }

    fn check_unary(&mut self, op: Token, inner: ExprId) -> DataType {
        let ty = self.check_expression(inner, None);
        match op.kind {
            TokenKind::Minus => {
                if ty != DataType::Int && ty != DataType::Float {
                    self.error(op, "Operator '-' only defined for 'int' and 'float'.");
                }
            }
            TokenKind::Tilde => {
                if ty != DataType::Int {
                    self.error(op, "Operator '~' only defined for 'int'.");
                }
            }
            TokenKind::Bang | TokenKind::Not => {
                if ty != DataType::Bool {
                    self.error(op, "Operator 'not' only defined for 'bool'.");
                }
            }
            _ => self.error(op, "Unknown unary operator."),
        }
        ty
    }

    fn check_binary(&mut self, expr: ExprId, op: Token, left: ExprId, right: ExprId) -> DataType {
        let mut left_ty = self.check_expression(left, None);
        let mut right_ty = self.check_expression(right, None);

        // Null literals adopt the nullable type of the other side.
        if left_ty == DataType::Null && right_ty.nullable() {
            let cast = self.insert_cast(left, &right_ty);
            self.replace_binary_side(expr, true, cast);
            left_ty = right_ty.clone();
        } else if right_ty == DataType::Null && left_ty.nullable() {
            let cast = self.insert_cast(right, &left_ty);
            self.replace_binary_side(expr, false, cast);
            right_ty = left_ty.clone();
        }

        if left_ty != right_ty {
            // Implicit widening to float when one side is integer.
            if left_ty == DataType::Int && right_ty == DataType::Float {
                let cast = self.insert_cast(left, &DataType::Float);
                self.replace_binary_side(expr, true, cast);
                left_ty = DataType::Float;
            } else if left_ty == DataType::Float && right_ty == DataType::Int {
                let cast = self.insert_cast(right, &DataType::Float);
                self.replace_binary_side(expr, false, cast);
                right_ty = DataType::Float;
            } else {
                self.error_type_mismatch(op);
            }
        }
        let _ = right_ty;

        let operand = left_ty;
        let mut method = None;

        let result = match op.kind {
            TokenKind::And | TokenKind::Or => {
                if operand != DataType::Bool {
                    self.error(op, "Operator only defined for 'bool'.");
                }
                DataType::Bool
            }
            TokenKind::EqualEqual | TokenKind::BangEqual => match &operand {
                DataType::Int
                | DataType::Bool
                | DataType::Char
                | DataType::Float
                | DataType::Str
                | DataType::Any
                | DataType::Null => DataType::Bool,
                DataType::Object(class) => {
                    // Pointer equality unless the class defines an
                    // equality member.
                    method = self.find_operator_member(*class, op.kind);
                    match method {
                        Some(method) => self.ast.func(method).ret.clone(),
                        None => DataType::Bool,
                    }
                }
                _ => {
                    self.error(op, "Operator only defined for 'int', 'float', 'bool'.");
                    DataType::Bool
                }
            },
            TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual => match &operand {
                DataType::Int | DataType::Bool | DataType::Char | DataType::Float => DataType::Bool,
                DataType::Object(class) => {
                    method = self.find_operator_member(*class, op.kind);
                    match method {
                        Some(method) => self.ast.func(method).ret.clone(),
                        None => {
                            self.operator_member_missing(*class, op);
                            DataType::Bool
                        }
                    }
                }
                _ => {
                    self.error(op, "Operator only defined for 'int', 'float', 'bool'.");
                    DataType::Bool
                }
            },
            TokenKind::Plus => match &operand {
                DataType::Int | DataType::Char | DataType::Float | DataType::Str => operand.clone(),
                DataType::Object(class) => {
                    method = self.find_operator_member(*class, op.kind);
                    match method {
                        Some(method) => self.ast.func(method).ret.clone(),
                        None => {
                            self.operator_member_missing(*class, op);
                            operand.clone()
                        }
                    }
                }
                _ => {
                    self.error(op, "Operator '+' only defined for 'int', 'float', 'string'.");
                    operand.clone()
                }
            },
            TokenKind::Minus | TokenKind::Star | TokenKind::Slash => match &operand {
                DataType::Int | DataType::Char | DataType::Float => operand.clone(),
                DataType::Object(class) => {
                    method = self.find_operator_member(*class, op.kind);
                    match method {
                        Some(method) => self.ast.func(method).ret.clone(),
                        None => {
                            self.operator_member_missing(*class, op);
                            operand.clone()
                        }
                    }
                }
                _ => {
                    self.error(op, "Operator only defined for 'int' and 'float'.");
                    operand.clone()
                }
            },
            TokenKind::Percent
            | TokenKind::Ampersand
            | TokenKind::Pipe
            | TokenKind::Caret
            | TokenKind::LessLess
            | TokenKind::GreaterGreater => match &operand {
                DataType::Int | DataType::Char => operand.clone(),
                DataType::Object(class) => {
                    method = self.find_operator_member(*class, op.kind);
                    match method {
                        Some(method) => self.ast.func(method).ret.clone(),
                        None => {
                            self.operator_member_missing(*class, op);
                            operand.clone()
                        }
                    }
                }
                _ => {
                    self.error(op, "Operator only defined for 'int'.");
                    operand.clone()
                }
            },
            _ => {
                self.error(op, "Unknown binary operator.");
                operand.clone()
            }
        };

        if let ExprKind::Binary { operand_ty, method: slot, .. } = &mut self.ast.expr_mut(expr).kind
        {
            *operand_ty = operand;
            *slot = method;
        }

        result
    }

    fn replace_binary_side(&mut self, expr: ExprId, left_side: bool, new_side: ExprId) {
        if let ExprKind::Binary { left, right, .. } = &mut self.ast.expr_mut(expr).kind {
            if left_side {
                *left = new_side;
            } else {
                *right = new_side;
            }
        }
    }

    fn find_operator_member(&mut self, class: crate::ast::ClassId, op: TokenKind) -> Option<FnId> {
        let name = operator_member_name(op)?;
        let name = self.interner.lookup(name)?;
        match self.ast.class(class).members.get(&name) {
            Some(Member::Method(method)) => Some(*method),
            _ => None,
        }
    }

    fn operator_member_missing(&mut self, class: crate::ast::ClassId, op: Token) {
        let class_name = self.class_display_name(class);
        let op_text = self.interner.resolve(op.lexeme).to_string();
        self.error(
            op,
            format!("Operator '{}' is not defined for class '{}'.", op_text, class_name),
        );
    }

    fn check_var(
        &mut self,
        expr: ExprId,
        token: Token,
        name: crate::intern::Symbol,
        targs: &[crate::ast::TypeExpr],
    ) -> DataType {
        if let Some(var) = self.lookup_var(name) {
            if let ExprKind::Var { var: slot, .. } = &mut self.ast.expr_mut(expr).kind {
                *slot = Some(var);
            }
            return self.ast.var(var).ty.clone();
        }

        let funcs = self.lookup_funcs(name);
        if !funcs.is_empty() {
            if !targs.is_empty() {
                let targs: Vec<DataType> = targs.iter().map(|t| self.resolve_type(t)).collect();
                if let Some(&template) = funcs.iter().find(|&&f| self.ast.func(f).is_template) {
                    return match self.instantiate_function(template, &targs, token) {
                        Some(instance) => DataType::Function(instance),
                        None => DataType::Void,
                    };
                }
                self.error(token, "Only template functions take type arguments.");
                return DataType::Void;
            }
            if funcs.len() == 1 {
                let func = funcs[0];
                if self.ast.func(func).is_template {
                    return DataType::FunctionTemplate(func);
                }
                return if self.ast.func(func).class.is_some() {
                    DataType::FunctionMember(func)
                } else {
                    DataType::Function(func)
                };
            }
            return DataType::FunctionGroup(funcs);
        }

        if let Some(class) = self.lookup_class(name) {
            return if self.ast.class(class).is_template {
                if !targs.is_empty() {
                    let targs: Vec<DataType> = targs.iter().map(|t| self.resolve_type(t)).collect();
                    match self.instantiate_class(class, &targs, token) {
                        Some(instance) => DataType::Prototype(instance),
                        None => DataType::Void,
                    }
                } else {
                    DataType::PrototypeTemplate(class)
                }
            } else {
                DataType::Prototype(class)
            };
        }

        // Inside a method, bare member names resolve through `this`.
        if let Some(class) = self.current_class {
            if let Some(member) = self.ast.class(class).members.get(&name).cloned() {
                let this = self.ast.alloc_expr(ExprKind::This, token);
                self.ast.expr_mut(this).ty = DataType::Object(class);
                match member {
                    Member::Field(field) => {
                        let ty = self.ast.var(field).ty.clone();
                        self.ast.expr_mut(expr).kind = ExprKind::Access {
                            expr: this,
                            name: token,
                            var: Some(field),
                            object_ty: DataType::Object(class),
                        };
                        return ty;
                    }
                    Member::Method(method) => {
                        self.ast.expr_mut(expr).kind = ExprKind::Access {
                            expr: this,
                            name: token,
                            var: None,
                            object_ty: DataType::Object(class),
                        };
                        return if self.ast.func(method).is_template {
                            DataType::FunctionTemplate(method)
                        } else {
                            DataType::FunctionMember(method)
                        };
                    }
                }
            }
        }

        if let Some(internal) = global_internal(self.interner.resolve(name)) {
            return internal;
        }

        let text = self.interner.resolve(name).to_string();
        self.error(token, format!("Undefined name '{}'.", text));
        DataType::Void
    }

    fn check_access(&mut self, expr: ExprId, object: ExprId, name: Token) -> DataType {
        let object_ty = self.check_expression(object, None);
        let member = self.interner.resolve(name.lexeme).to_string();

        let ty = match &object_ty {
            DataType::Str => match member.as_str() {
                "length" => DataType::Int,
                _ => match string_member_internal(&member) {
                    Some(internal) => internal,
                    None => {
                        self.unknown_member(&object_ty, name);
                        DataType::Void
                    }
                },
            },
            DataType::Array { dims, elem } => match member.as_str() {
                "length" | "capacity" => DataType::Int,
                "push" => DataType::FunctionInternal {
                    name: "array.push",
                    params: vec![object_ty.clone(), object_ty.element()],
                    ret: Box::new(DataType::Void),
                },
                "pop" => DataType::FunctionInternal {
                    name: "array.pop",
                    params: vec![object_ty.clone()],
                    ret: Box::new(object_ty.element()),
                },
                "clear" => DataType::FunctionInternal {
                    name: "array.clear",
                    params: vec![object_ty.clone()],
                    ret: Box::new(DataType::Void),
                },
                "reserve" => {
                    let mut params = vec![object_ty.clone()];
                    params.extend(std::iter::repeat(DataType::Int).take(*dims as usize));
                    DataType::FunctionInternal {
                        name: "array.reserve",
                        params,
                        ret: Box::new(DataType::Void),
                    }
                }
                "to_string" if *dims == 1 && **elem == DataType::Char => {
                    DataType::FunctionInternal {
                        name: "array.to_string",
                        params: vec![object_ty.clone()],
                        ret: Box::new(DataType::Str),
                    }
                }
                "join" if *dims == 1 && **elem == DataType::Str => DataType::FunctionInternal {
                    name: "string.join",
                    params: vec![object_ty.clone(), DataType::Str],
                    ret: Box::new(DataType::Str),
                },
                _ => {
                    self.unknown_member(&object_ty, name);
                    DataType::Void
                }
            },
            DataType::Int => match member.as_str() {
                "hash" => DataType::FunctionInternal {
                    name: "int.hash",
                    params: vec![DataType::Int],
                    ret: Box::new(DataType::Int),
                },
                _ => {
                    self.unknown_member(&object_ty, name);
                    DataType::Void
                }
            },
            DataType::Float => match member.as_str() {
                "hash" => DataType::FunctionInternal {
                    name: "float.hash",
                    params: vec![DataType::Float],
                    ret: Box::new(DataType::Int),
                },
                "sqrt" => DataType::FunctionInternal {
                    name: "float.sqrt",
                    params: vec![DataType::Float],
                    ret: Box::new(DataType::Float),
                },
                _ => {
                    self.unknown_member(&object_ty, name);
                    DataType::Void
                }
            },
            DataType::Object(class) => match self.ast.class(*class).members.get(&name.lexeme) {
                Some(Member::Field(field)) => {
                    let field = *field;
                    if let ExprKind::Access { var, .. } = &mut self.ast.expr_mut(expr).kind {
                        *var = Some(field);
                    }
                    self.ast.var(field).ty.clone()
                }
                Some(Member::Method(method)) => {
                    let method = *method;
                    if self.ast.func(method).is_template {
                        DataType::FunctionTemplate(method)
                    } else {
                        DataType::FunctionMember(method)
                    }
                }
                None => {
                    self.unknown_member(&object_ty, name);
                    DataType::Void
                }
            },
            _ => {
                self.unknown_member(&object_ty, name);
                DataType::Void
            }
        };

        if let ExprKind::Access { object_ty: slot, .. } = &mut self.ast.expr_mut(expr).kind {
            *slot = object_ty;
        }

        ty
    }

    fn unknown_member(&mut self, object_ty: &DataType, name: Token) {
        let ty_name = canonical_name(object_ty, self.ast, self.interner);
        let member = self.interner.resolve(name.lexeme).to_string();
        self.error(name, format!("Type '{}' has no member '{}'.", ty_name, member));
    }

    fn check_index(&mut self, expr: ExprId, target: ExprId, index: ExprId) -> DataType {
        let target_ty = self.check_expression(target, None);
        let index_ty = self.check_expression(index, Some(&DataType::Int));

        let mut method = None;
        let ty = match &target_ty {
            DataType::Str => {
                if index_ty != DataType::Int {
                    self.error_type_mismatch(self.ast.expr(index).token);
                }
                DataType::Char
            }
            DataType::Array { .. } => {
                if index_ty != DataType::Int {
                    self.error_type_mismatch(self.ast.expr(index).token);
                }
                target_ty.element()
            }
            DataType::Object(class) => {
                let name = self.interner.intern("__index__");
                match self.ast.class(*class).members.get(&name) {
                    Some(Member::Method(found)) => {
                        let found = *found;
                        method = Some(found);
                        let params = self.function_params(found);
                        if params.len() != 2 {
                            self.error_type_mismatch(self.ast.expr(expr).token);
                        } else {
                            let coerced = self.coerce(index, &params[1]);
                            if let ExprKind::Index { index: slot, .. } =
                                &mut self.ast.expr_mut(expr).kind
                            {
                                *slot = coerced;
                            }
                        }
                        self.ast.func(found).ret.clone()
                    }
                    _ => {
                        let class_name = self.class_display_name(*class);
                        self.error(
                            self.ast.expr(expr).token,
                            format!("Class '{}' has no '__index__' member.", class_name),
                        );
                        DataType::Void
                    }
                }
            }
            _ => {
                self.error_type_mismatch(self.ast.expr(expr).token);
                DataType::Void
            }
        };

        if let ExprKind::Index { expr_ty, method: slot, .. } = &mut self.ast.expr_mut(expr).kind {
            *expr_ty = target_ty;
            *slot = method;
        }

        ty
    }

    fn check_array_literal(
        &mut self,
        expr: ExprId,
        token: Token,
        elems: &[ExprId],
        expected: Option<&DataType>,
    ) -> DataType {
        if elems.is_empty() {
            return match expected {
                Some(ty @ DataType::Array { .. }) => ty.clone(),
                _ => {
                    self.error(token, "Cannot infer the type of an empty array literal.");
                    DataType::array(DataType::Int)
                }
            };
        }

        let expected_elem = match expected {
            Some(ty @ DataType::Array { .. }) => Some(ty.element()),
            _ => None,
        };

        let elem_ty = self.check_expression(elems[0], expected_elem.as_ref());
        for &elem in &elems[1..] {
            self.check_expression(elem, Some(&elem_ty));
        }

        let mut coerced = Vec::with_capacity(elems.len());
        for &elem in elems {
            coerced.push(self.coerce(elem, &elem_ty));
        }
        if let ExprKind::ArrayLit { elems: slot } = &mut self.ast.expr_mut(expr).kind {
            *slot = coerced;
        }

        DataType::array(elem_ty)
    }

    fn check_assignment(&mut self, expr: ExprId, target: ExprId, value: ExprId) -> DataType {
        let target_ty = self.check_expression(target, None);
        let target_kind = self.ast.expr(target).kind.clone();

        let (value_ty, var, method) = match target_kind {
            ExprKind::Var { var: Some(var), .. } => {
                self.check_expression(value, Some(&target_ty));
                let coerced = self.coerce(value, &target_ty);
                self.replace_assign_value(expr, coerced);
                (target_ty.clone(), Some(var), None)
            }
            ExprKind::Access { var: Some(field), .. } => {
                self.check_expression(value, Some(&target_ty));
                let coerced = self.coerce(value, &target_ty);
                self.replace_assign_value(expr, coerced);
                (target_ty.clone(), Some(field), None)
            }
            ExprKind::Index { expr_ty, method: get_method, .. } => match &expr_ty {
                DataType::Array { .. } => {
                    let elem = expr_ty.element();
                    self.check_expression(value, Some(&elem));
                    let coerced = self.coerce(value, &elem);
                    self.replace_assign_value(expr, coerced);
                    (elem, None, None)
                }
                DataType::Object(class) => {
                    let _ = get_method;
                    let name = self.interner.intern("__index_set__");
                    match self.ast.class(*class).members.get(&name) {
                        Some(Member::Method(setter)) => {
                            let setter = *setter;
                            let params = self.function_params(setter);
                            let value_param =
                                params.get(2).cloned().unwrap_or(DataType::Void);
                            self.check_expression(value, Some(&value_param));
                            let coerced = self.coerce(value, &value_param);
                            self.replace_assign_value(expr, coerced);
                            (value_param, None, Some(setter))
                        }
                        _ => {
                            let class_name = self.class_display_name(*class);
                            let token = self.ast.expr(expr).token;
                            self.error(
                                token,
                                format!(
                                    "Class '{}' has no '__index_set__' member.",
                                    class_name
                                ),
                            );
                            (DataType::Void, None, None)
                        }
                    }
                }
                _ => {
                    self.error_type_mismatch(self.ast.expr(expr).token);
                    (DataType::Void, None, None)
                }
            },
            _ => {
                self.error(self.ast.expr(expr).token, "Invalid assignment target.");
                (DataType::Void, None, None)
            }
        };

        if let ExprKind::Assign { var: var_slot, method: method_slot, value_ty: ty_slot, .. } =
            &mut self.ast.expr_mut(expr).kind
        {
            *var_slot = var;
            *method_slot = method;
            *ty_slot = value_ty.clone();
        }

        value_ty
    }

    fn replace_assign_value(&mut self, expr: ExprId, new_value: ExprId) {
        if let ExprKind::Assign { value, .. } = &mut self.ast.expr_mut(expr).kind {
            *value = new_value;
        }
    }

    fn check_call(
        &mut self,
        expr: ExprId,
        token: Token,
        callee: ExprId,
        args: &[ExprId],
    ) -> DataType {
        let mut callee_ty = self.check_expression(callee, None);

        let mut arg_tys = Vec::with_capacity(args.len());
        for &arg in args {
            arg_tys.push(self.check_expression(arg, None));
        }

        // A char-array push with a string argument appends the bytes.
        let push_string_receiver = match &callee_ty {
            DataType::FunctionInternal { name: "array.push", params, .. }
                if params.get(1) == Some(&DataType::Char)
                    && arg_tys.first() == Some(&DataType::Str) =>
            {
                Some(params[0].clone())
            }
            _ => None,
        };
        if let Some(receiver) = push_string_receiver {
            callee_ty = DataType::FunctionInternal {
                name: "array.push_string",
                params: vec![receiver, DataType::Str],
                ret: Box::new(DataType::Void),
            };
            self.ast.expr_mut(callee).ty = callee_ty.clone();
        }

        let mut func = None;
        let ret;
        let param_tys: Vec<DataType>;

        match &callee_ty {
            DataType::Function(f) => {
                func = Some(*f);
                param_tys = self.function_params(*f);
                ret = self.ast.func(*f).ret.clone();
            }
            DataType::FunctionMember(f) => {
                func = Some(*f);
                // Parameter 0 is the receiver, supplied by the access.
                param_tys = self.function_params(*f).get(1..).unwrap_or(&[]).to_vec();
                ret = self.ast.func(*f).ret.clone();
            }
            DataType::FunctionInternal { params, ret: internal_ret, .. } => {
                // Member internals carry the receiver as parameter 0;
                // global internals (alloc, read/write) do not.
                let is_member = matches!(self.ast.expr(callee).kind, ExprKind::Access { .. });
                param_tys = if is_member {
                    params.get(1..).unwrap_or(&[]).to_vec()
                } else {
                    params.clone()
                };
                ret = (**internal_ret).clone();
            }
            DataType::FunctionPointer { params, ret: pointer_ret } => {
                param_tys = params.clone();
                ret = (**pointer_ret).clone();
            }
            DataType::FunctionGroup(candidates) => {
                match self.pick_overload(candidates, &arg_tys, token) {
                    Some(picked) => {
                        func = Some(picked);
                        let all = self.function_params(picked);
                        param_tys = if self.ast.func(picked).class.is_some() {
                            all.get(1..).unwrap_or(&[]).to_vec()
                        } else {
                            all
                        };
                        ret = self.ast.func(picked).ret.clone();
                        let picked_ty = if self.ast.func(picked).class.is_some() {
                            DataType::FunctionMember(picked)
                        } else {
                            DataType::Function(picked)
                        };
                        callee_ty = picked_ty.clone();
                        self.ast.expr_mut(callee).ty = picked_ty;
                    }
                    None => {
                        param_tys = Vec::new();
                        ret = DataType::Void;
                    }
                }
            }
            DataType::FunctionTemplate(template) => {
                let template = *template;
                match self.infer_template(template, &arg_tys, token) {
                    Some(instance) => {
                        func = Some(instance);
                        let all = self.function_params(instance);
                        param_tys = if self.ast.func(instance).class.is_some() {
                            all.get(1..).unwrap_or(&[]).to_vec()
                        } else {
                            all
                        };
                        ret = self.ast.func(instance).ret.clone();
                        let instance_ty = if self.ast.func(instance).class.is_some() {
                            DataType::FunctionMember(instance)
                        } else {
                            DataType::Function(instance)
                        };
                        callee_ty = instance_ty.clone();
                        self.ast.expr_mut(callee).ty = instance_ty;
                    }
                    None => {
                        param_tys = Vec::new();
                        ret = DataType::Void;
                    }
                }
            }
            DataType::Prototype(class) => {
                let class = *class;
                let initializers = self.ast.class(class).initializers.clone();
                if initializers.is_empty() {
                    if !args.is_empty() {
                        self.error(token, "Wrong number of arguments.");
                    }
                    param_tys = Vec::new();
                } else {
                    match self.pick_initializer(&initializers, &arg_tys, token) {
                        Some(init) => {
                            func = Some(init);
                            param_tys = self.function_params(init).get(1..).unwrap_or(&[]).to_vec();
                        }
                        None => param_tys = Vec::new(),
                    }
                }
                ret = DataType::Object(class);
            }
            DataType::PrototypeTemplate(_) => {
                self.error(token, "Template classes require explicit type arguments.");
                param_tys = Vec::new();
                ret = DataType::Void;
            }
            DataType::Void => {
                // Callee failed to resolve; an error was already issued.
                param_tys = Vec::new();
                ret = DataType::Void;
            }
            _ => {
                self.error(token, "Expression is not callable.");
                param_tys = Vec::new();
                ret = DataType::Void;
            }
        }

        if !matches!(callee_ty, DataType::Void) {
            if args.len() != param_tys.len() {
                self.error(token, "Wrong number of arguments.");
            } else {
                let mut coerced = Vec::with_capacity(args.len());
                for (&arg, param) in args.iter().zip(&param_tys) {
                    coerced.push(self.coerce(arg, param));
                }
                if let ExprKind::Call { args: slot, .. } = &mut self.ast.expr_mut(expr).kind {
                    *slot = coerced;
                }
            }
        }

        if let ExprKind::Call { func: func_slot, callee_ty: ty_slot, ret_ty: ret_slot, .. } =
            &mut self.ast.expr_mut(expr).kind
        {
            *func_slot = func;
            *ty_slot = callee_ty;
            *ret_slot = ret.clone();
        }

        ret
    }

    fn pick_overload(
        &mut self,
        candidates: &[FnId],
        args: &[DataType],
        token: Token,
    ) -> Option<FnId> {
        let mut best: Option<(u32, FnId)> = None;
        let mut ambiguous = false;

        for &candidate in candidates {
            if self.ast.func(candidate).is_template {
                continue;
            }
            let params = self.function_params(candidate);
            let params =
                if self.ast.func(candidate).class.is_some() {
                    params.get(1..).unwrap_or(&[])
                } else {
                    &params[..]
                };
            if let Some(cost) = self.match_candidate(args, params) {
                match best {
                    Some((best_cost, current)) if cost == best_cost => {
                        // User-defined overloads shadow imported
                        // built-ins of the same signature.
                        let current_imported = self.ast.func(current).imported;
                        let candidate_imported = self.ast.func(candidate).imported;
                        if current_imported && !candidate_imported {
                            best = Some((cost, candidate));
                        } else if current_imported == candidate_imported {
                            ambiguous = true;
                        }
                    }
                    Some((best_cost, _)) if cost < best_cost => {
                        best = Some((cost, candidate));
                        ambiguous = false;
                    }
                    None => best = Some((cost, candidate)),
                    _ => {}
                }
            }
        }

        match best {
            Some((_, found)) if !ambiguous => Some(found),
            Some(_) => {
                self.error(token, "Ambiguous call.");
                None
            }
            None => {
                self.error(token, "No matching overload.");
                None
            }
        }
    }

    fn pick_initializer(
        &mut self,
        initializers: &[FnId],
        args: &[DataType],
        token: Token,
    ) -> Option<FnId> {
        let mut best: Option<(u32, FnId)> = None;
        let mut ambiguous = false;

        for &candidate in initializers {
            let params = self.function_params(candidate);
            if let Some(cost) = self.match_candidate(args, params.get(1..).unwrap_or(&[])) {
                match best {
                    Some((best_cost, _)) if cost == best_cost => ambiguous = true,
                    Some((best_cost, _)) if cost < best_cost => {
                        best = Some((cost, candidate));
                        ambiguous = false;
                    }
                    None => best = Some((cost, candidate)),
                    _ => {}
                }
            }
        }

        match best {
            Some((_, found)) if !ambiguous => Some(found),
            Some(_) => {
                self.error(token, "Ambiguous call.");
                None
            }
            None => {
                self.error(token, "No matching overload.");
                None
            }
        }
    }

    /// Exact matches win over promotions; promotions win over `any`.
    fn match_candidate(&self, args: &[DataType], params: &[DataType]) -> Option<u32> {
        if args.len() != params.len() {
            return None;
        }
        let mut cost = 0;
        for (arg, param) in args.iter().zip(params) {
            if arg == param {
                continue;
            }
            cost += match (arg, param) {
                (DataType::Int, DataType::Float) => 1,
                (DataType::Null, p) if p.nullable() => 1,
                (_, DataType::Any) if arg.primitive() || arg.is_reference() => 2,
                _ => return None,
            };
        }
        Some(cost)
    }

    fn infer_template(&mut self, template: FnId, args: &[DataType], token: Token) -> Option<FnId> {
        let tparams = self.ast.func(template).tparams.clone();
        let params = self.ast.func(template).params.clone();

        let mut bindings: Vec<Option<DataType>> = vec![None; tparams.len()];

        let skip_this = self.ast.func(template).class.is_some() as usize;
        for (param, arg) in params.iter().skip(skip_this).zip(args) {
            let ty_expr = self.ast.var(*param).ty_expr.clone();
            if let Some(ty_expr) = ty_expr {
                unify(&ty_expr, arg, &tparams, &mut bindings, self.interner);
            }
        }

        let mut targs = Vec::with_capacity(tparams.len());
        for binding in bindings {
            match binding {
                Some(ty) => targs.push(ty),
                None => {
                    self.error(token, "Cannot infer template type arguments.");
                    return None;
                }
            }
        }

        self.instantiate_function(template, &targs, token)
    }

    pub(crate) fn function_params(&self, func: FnId) -> Vec<DataType> {
        self.ast.func(func).params.iter().map(|&p| self.ast.var(p).ty.clone()).collect()
    }

    /// Wraps `expr` in an implicit cast to `to` when the types differ,
    /// reporting a mismatch when no implicit conversion exists.
    pub(crate) fn coerce(&mut self, expr: ExprId, to: &DataType) -> ExprId {
        let from = self.ast.expr(expr).ty.clone();
        if from == *to || *to == DataType::Void {
            return expr;
        }

        let allowed = match (&from, to) {
            (DataType::Int, DataType::Float) => true,
            (DataType::Null, t) if t.nullable() => true,
            (f, DataType::Any) if f.primitive() || f.is_reference() => true,
            (DataType::Function(f), DataType::FunctionPointer { params, ret })
            | (DataType::FunctionMember(f), DataType::FunctionPointer { params, ret }) => {
                let decl_params = self.function_params(*f);
                decl_params == *params && self.ast.func(*f).ret == **ret
            }
            (DataType::FunctionInternal { params: fp, ret: fr, .. },
                DataType::FunctionPointer { params, ret }) => fp == params && fr == ret,
            _ => false,
        };

        if !allowed {
            let token = self.ast.expr(expr).token;
            self.error_type_mismatch(token);
            return expr;
        }

        self.insert_cast(expr, to)
    }

    pub(crate) fn insert_cast(&mut self, expr: ExprId, to: &DataType) -> ExprId {
        let token = self.ast.expr(expr).token;
        let from = self.ast.expr(expr).ty.clone();
        let cast = self.ast.alloc_expr(
            ExprKind::Cast { expr, ty_expr: None, from },
            token,
        );
        self.ast.expr_mut(cast).ty = to.clone();
        cast
    }
}

fn operator_member_name(op: TokenKind) -> Option<&'static str> {
    Some(match op {
        TokenKind::Plus => "__add__",
        TokenKind::Minus => "__sub__",
        TokenKind::Star => "__mul__",
        TokenKind::Slash => "__div__",
        TokenKind::Percent => "__mod__",
        TokenKind::Ampersand => "__and__",
        TokenKind::Pipe => "__or__",
        TokenKind::Caret => "__xor__",
        TokenKind::LessLess => "__shl__",
        TokenKind::GreaterGreater => "__shr__",
        TokenKind::EqualEqual => "__eq__",
        TokenKind::BangEqual => "__ne__",
        TokenKind::Less => "__lt__",
        TokenKind::LessEqual => "__le__",
        TokenKind::Greater => "__gt__",
        TokenKind::GreaterEqual => "__ge__",
        _ => return None,
    })
}

fn string_member_internal(member: &str) -> Option<DataType> {
    let (name, params, ret): (&'static str, Vec<DataType>, DataType) = match member {
        "hash" => ("string.hash", vec![DataType::Str], DataType::Int),
        "index_of" => ("string.index_of", vec![DataType::Str, DataType::Str], DataType::Int),
        "count" => ("string.count", vec![DataType::Str, DataType::Str], DataType::Int),
        "replace" => (
            "string.replace",
            vec![DataType::Str, DataType::Str, DataType::Str],
            DataType::Str,
        ),
        "trim" => ("string.trim", vec![DataType::Str], DataType::Str),
        "starts_with" => {
            ("string.starts_with", vec![DataType::Str, DataType::Str], DataType::Bool)
        }
        "ends_with" => ("string.ends_with", vec![DataType::Str, DataType::Str], DataType::Bool),
        "contains" => ("string.contains", vec![DataType::Str, DataType::Str], DataType::Bool),
        "split" => (
            "string.split",
            vec![DataType::Str, DataType::Str],
            DataType::array(DataType::Str),
        ),
        "pad" => ("string.pad", vec![DataType::Str, DataType::Int], DataType::Str),
        "to_array" => ("string.to_array", vec![DataType::Str], DataType::array(DataType::Char)),
        _ => return None,
    };
    Some(DataType::FunctionInternal { name, params, ret: Box::new(ret) })
}

fn global_internal(name: &str) -> Option<DataType> {
    let (name, params, ret): (&'static str, Vec<DataType>, DataType) = match name {
        "alloc" => ("alloc", vec![DataType::Int], DataType::Int),
        "allocReset" => ("allocReset", vec![], DataType::Void),
        "memory" => ("memory", vec![], DataType::Int),
        "writeInt" => ("writeInt", vec![DataType::Int, DataType::Int], DataType::Void),
        "writeFloat" => ("writeFloat", vec![DataType::Int, DataType::Float], DataType::Void),
        "writeChar" => ("writeChar", vec![DataType::Int, DataType::Char], DataType::Void),
        "writeBool" => ("writeBool", vec![DataType::Int, DataType::Bool], DataType::Void),
        "readInt" => ("readInt", vec![DataType::Int], DataType::Int),
        "readFloat" => ("readFloat", vec![DataType::Int], DataType::Float),
        "readChar" => ("readChar", vec![DataType::Int], DataType::Char),
        "readBool" => ("readBool", vec![DataType::Int], DataType::Bool),
        _ => return None,
    };
    Some(DataType::FunctionInternal { name, params, ret: Box::new(ret) })
}

fn unify(
    ty_expr: &crate::ast::TypeExpr,
    arg: &DataType,
    tparams: &[crate::intern::Symbol],
    bindings: &mut [Option<DataType>],
    interner: &crate::intern::Interner,
) {
    if ty_expr.name.kind == TokenKind::Identifier {
        if let Some(position) = tparams.iter().position(|&t| t == ty_expr.name.lexeme) {
            if bindings[position].is_none() {
                bindings[position] = Some(arg.clone());
            }
            return;
        }
        if interner.resolve(ty_expr.name.lexeme) == "array" && ty_expr.args.len() == 1 {
            if let DataType::Array { .. } = arg {
                unify(&ty_expr.args[0], &arg.element(), tparams, bindings, interner);
            }
        }
    }
}

fn cast_allowed(from: &DataType, to: &DataType) -> bool {
    if from == to {
        return true;
    }
    match (from, to) {
        // Stringification covers every printable shape.
        (
            DataType::Bool
            | DataType::Int
            | DataType::Float
            | DataType::Char
            | DataType::Str
            | DataType::Array { .. }
            | DataType::Object(_)
            | DataType::Any,
            DataType::Str,
        ) => true,
        (DataType::Int | DataType::Bool, DataType::Float) => true,
        (DataType::Float | DataType::Char | DataType::Bool, DataType::Int) => true,
        (DataType::Int, DataType::Char) => true,
        (
            DataType::Float
            | DataType::Int
            | DataType::Str
            | DataType::Any
            | DataType::Null
            | DataType::Object(_)
            | DataType::FunctionPointer { .. },
            DataType::Bool,
        ) => true,
        (DataType::Any, t) if t.is_reference() || t.primitive() => true,
        (f, DataType::Any) if f.primitive() || f.is_reference() => true,
        (DataType::Null, t) if t.nullable() => true,
        (
            DataType::Function(_) | DataType::FunctionMember(_) | DataType::FunctionInternal { .. },
            DataType::FunctionPointer { .. },
        ) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cast_table_accepts_stringification_and_any() {
        assert!(cast_allowed(&DataType::Int, &DataType::Str));
        assert!(cast_allowed(&DataType::array(DataType::Int), &DataType::Str));
        assert!(cast_allowed(&DataType::Int, &DataType::Any));
        assert!(cast_allowed(&DataType::Any, &DataType::Int));
        assert!(!cast_allowed(&DataType::Str, &DataType::Float));
    }
}
